//! Identity and destination keys.

mod keys;

pub use keys::*;
