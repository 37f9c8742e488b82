pub mod id;

pub use id::{is_valid_id, prefixed_ulid};
