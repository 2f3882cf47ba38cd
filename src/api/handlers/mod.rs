mod admin;
mod missing;
mod objects;

pub use admin::{health, statistics, track_requests, upload_form};
pub use missing::missing_objects;
pub use objects::{create_object, get_object, place_object};
