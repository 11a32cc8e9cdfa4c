//! Shared types for the bot fleet workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
