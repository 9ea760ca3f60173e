//! Shared helpers

pub mod error;
pub mod time;

pub use error::{CoordinatorError, CoordinatorResult, ErrorKind, ErrorResponse};
