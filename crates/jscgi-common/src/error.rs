use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::response::{ErrorPayload, ExecutionResult};

#[derive(Error, Debug)]
pub enum CgiError {
    #[error("Access denied for {0}")]
    AccessDenied(IpAddr),

    #[error("File not found. {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Script { message: String, stack: String },

    #[error("Timeout expired ({elapsed_ms} ms) for {}", path.display())]
    Timeout { elapsed_ms: u128, path: PathBuf },

    #[error("Failed to start worker: {0}")]
    Fork(String),

    #[error("Worker fatal error: {0}")]
    WorkerFatal(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Cannot load module '{0}'")]
    Module(String),

    #[error("Use file is malformed. {} must export a function", .0.display())]
    MalformedUseFile(PathBuf),

    #[error("JavaScript execution error: {0}")]
    JavaScriptExecution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl CgiError {
    /// HTTP status a request-scoped error resolves to.
    ///
    /// Process-level errors (`Fork`, `WorkerFatal`, ...) never reach a client
    /// directly; they map to 500 for completeness.
    pub fn status_code(&self) -> u16 {
        match self {
            CgiError::AccessDenied(_) => 401,
            CgiError::NotFound(_) => 404,
            CgiError::Timeout { .. } => 408,
            _ => 500,
        }
    }

    /// Converts a request-scoped error into the response sent to the client.
    pub fn into_result(self) -> ExecutionResult {
        match self {
            CgiError::AccessDenied(_) => ExecutionResult::empty(401),
            CgiError::NotFound(_) | CgiError::Timeout { .. } => {
                let status = self.status_code();
                ExecutionResult::text(status, self.to_string())
            }
            CgiError::Script { message, stack } => {
                ExecutionResult::error(500, ErrorPayload { error: message, stack })
            }
            other => {
                let message = other.to_string();
                let stack = format!("{}\n    at {}", message, other.origin());
                ExecutionResult::error(other.status_code(), ErrorPayload { error: message, stack })
            }
        }
    }

    fn origin(&self) -> String {
        match self {
            CgiError::Read { path, .. } => path.display().to_string(),
            CgiError::Module(spec) => spec.clone(),
            CgiError::MalformedUseFile(path) => path.display().to_string(),
            _ => "jscgi".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CgiError>;
