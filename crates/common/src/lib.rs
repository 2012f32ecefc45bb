//! Shared types for the maxmux workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, mask};
