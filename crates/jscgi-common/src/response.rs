//! Response Types
//!
//! This module defines what a finished request turns into before it is
//! written to the wire: a status code, headers, and one of a few body shapes.

use serde::{Deserialize, Serialize};

/// Structured error body sent with 500 responses.
///
/// Serialized as `{"error": "...", "stack": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// String form of the thrown value (e.g. `Error: boom`)
    pub error: String,
    /// Stack trace, or a synthesized location when none is available
    pub stack: String,
}

/// Body of an [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// No body at all (401, `res.end()`)
    Empty,
    /// Plain text produced by the server (404, 408)
    Text(String),
    /// Raw bytes produced by a script
    Bytes(Vec<u8>),
    /// Structured error payload
    Error(ErrorPayload),
}

/// Final outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl ExecutionResult {
    /// A response without a body.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    /// A plain text response.
    pub fn text(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "text/html; charset=utf-8".into())],
            body: ResponseBody::Text(text.into()),
        }
    }

    /// A structured `{error, stack}` response.
    pub fn error(status: u16, payload: ErrorPayload) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json; charset=utf-8".into())],
            body: ResponseBody::Error(payload),
        }
    }

    /// Script output with the headers the script set.
    pub fn output(status: u16, headers: Vec<(String, String)>, bytes: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Bytes(bytes),
        }
    }

    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serializes the body into bytes ready for the wire.
    pub fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            ResponseBody::Empty => Vec::new(),
            ResponseBody::Text(text) => text.clone().into_bytes(),
            ResponseBody::Bytes(bytes) => bytes.clone(),
            ResponseBody::Error(payload) => serde_json::to_vec_pretty(payload).unwrap_or_default(),
        }
    }
}
