//! Utility modules

pub mod error;
pub mod fallback;

pub use error::{ErrorResponse, SessionError, SessionResult};
pub use fallback::{try_each, try_each_sync, FallbackError};
