//! Hashing and compression primitives shared by the store and the gateway.

pub mod gzip;
pub mod hash;

pub use gzip::ContentEncoding;
pub use hash::{hash_bytes, ContentHash, Hasher, ObjectName};
