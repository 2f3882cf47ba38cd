//! Content hashing and hash-derived path components.
//!
//! Objects are addressed by the SHA-256 of their logical bytes, encoded with the
//! URL-safe base64 alphabet. The 256 digest bits do not divide evenly into 6-bit
//! characters, so the spare bits are taken from the leading character of both the
//! directory prefix and the filename: each of those characters carries only 5 bits
//! and can therefore never be `-`, which keeps stored names from looking like
//! command-line switches.

use std::io::{self, Read};

use base64::Engine;
use ring::digest;

/// Encoding alphabet (identical to URL-safe base64).
pub const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of the fan-out directory component.
pub const PREFIX_LEN: usize = 2;

/// Length of the hash part of a stored filename.
pub const REMAINDER_LEN: usize = 41;

/// A content digest split into its directory prefix and filename remainder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    prefix: String,
    remainder: String,
}

impl ContentHash {
    fn from_digest(md: &[u8]) -> Self {
        debug_assert_eq!(md.len(), 32, "expected a SHA-256 digest");

        let mut prefix = String::with_capacity(PREFIX_LEN);
        prefix.push(ALPHABET[((md[0] & 0xf8) >> 3) as usize] as char);
        prefix.push(ALPHABET[(((md[0] & 0x07) << 3) + ((md[1] & 0xe0) >> 5)) as usize] as char);

        let mut remainder = String::with_capacity(REMAINDER_LEN);
        remainder.push(ALPHABET[(md[1] & 0x1f) as usize] as char);
        // 30 bytes encode to exactly 40 characters, so no padding is produced
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode_string(&md[2..], &mut remainder);

        Self { prefix, remainder }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn remainder(&self) -> &str {
        &self.remainder
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.prefix, self.remainder)
    }
}

/// Incremental hasher for streamed content.
pub struct Hasher {
    context: digest::Context,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            context: digest::Context::new(&digest::SHA256),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.update(data);
    }

    pub fn finish(self) -> ContentHash {
        ContentHash::from_digest(self.context.finish().as_ref())
    }
}

/// Hash an in-memory byte sequence.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_digest(digest::digest(&digest::SHA256, data).as_ref())
}

/// Hash everything a reader yields.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<ContentHash> {
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

fn is_leading_char(c: u8) -> bool {
    // 5-bit characters only reach the first 32 alphabet entries
    ALPHABET[..32].contains(&c)
}

fn is_alphabet_char(c: u8) -> bool {
    ALPHABET.contains(&c)
}

/// Whether `s` has the shape of a directory prefix.
pub fn is_valid_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == PREFIX_LEN && is_leading_char(b[0]) && is_alphabet_char(b[1])
}

/// The final path segment of a stored object: `remainder[_N][.ext]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName<'a> {
    pub remainder: &'a str,
    /// Collision index, `None` for the first slot.
    pub collision: Option<u32>,
    pub extension: Option<&'a str>,
}

impl<'a> ObjectName<'a> {
    /// Parse a filename segment, returning `None` if it is not shaped like a stored object.
    pub fn parse(segment: &'a str) -> Option<Self> {
        if segment.len() < REMAINDER_LEN || !segment.is_char_boundary(REMAINDER_LEN) {
            return None;
        }
        let (remainder, mut rest) = segment.split_at(REMAINDER_LEN);
        let rb = remainder.as_bytes();
        if !is_leading_char(rb[0]) || !rb[1..].iter().all(|&c| is_alphabet_char(c)) {
            return None;
        }

        let mut collision = None;
        if let Some(after) = rest.strip_prefix('_') {
            let digits = after.find('.').map_or(after, |dot| &after[..dot]);
            if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let index: u32 = digits.parse().ok()?;
            if index < 2 {
                return None;
            }
            collision = Some(index);
            rest = &after[digits.len()..];
        }

        let extension = match rest.strip_prefix('.') {
            Some(ext) if is_valid_extension(ext) => Some(ext),
            Some(_) => return None,
            None if rest.is_empty() => None,
            None => return None,
        };

        Some(Self {
            remainder,
            collision,
            extension,
        })
    }
}

fn is_valid_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.split('.').all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'+')
        })
}

/// Whether a request path looks like a stored object's location:
/// `/{dir...}/{prefix}/{remainder}[_N][.ext]`.
///
/// Used to avoid asking peers for paths that cannot exist anywhere.
pub fn is_location_shaped(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return false;
    }
    let n = segments.len();
    is_valid_prefix(segments[n - 2]) && ObjectName::parse(segments[n - 1]).is_some()
}
