//! Core traits, constants, and error types shared by every layer.

mod constants;
mod error;
mod logger;
mod traits;

pub use constants::*;
pub use error::*;
pub use logger::*;
pub use traits::*;
