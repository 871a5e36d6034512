//! jscgi Common Types
//!
//! Shared building blocks for the jscgi process manager:
//!
//! - [`config`] - the immutable server configuration handed to every component
//! - [`error`] - the error taxonomy and its mapping onto HTTP responses
//! - [`response`] - the final shape of a served request

pub mod config;
pub mod error;
pub mod response;

pub use config::Config;
pub use error::{CgiError, Result};
pub use response::{ErrorPayload, ExecutionResult, ResponseBody};
