//! Error taxonomy shared by every executor kind.
//!
//! Each variant maps to a stable classification string (see [`Error::kind`])
//! that is reported to the error counter whenever a failure path is taken.

use std::time::Duration;

/// Errors produced while registering templates or processing events.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The expression cannot be used at all, neither natively nor by the runtime.
    #[error("Template compilation failed: {message}")]
    Compilation { message: String },
    /// The worker binary could not be started.
    #[error("Failed to spawn template worker {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The worker started but never acknowledged the template.
    #[error("Template worker handshake failed: {message}")]
    Handshake { message: String },
    /// Lazy respawn gave up after the configured number of attempts.
    #[error("Template worker could not be respawned after {attempts} attempts: {source}")]
    RespawnExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    /// A single event failed evaluation.
    #[error("Template evaluation failed: {message}")]
    Evaluation { message: String },
    /// The exchange with a worker broke; the worker is terminated.
    #[error("Template transport failed: {message}")]
    Transport { message: String },
    /// The worker serving the request went away before answering.
    #[error("Template worker lost: {reason}")]
    WorkerLost { reason: String },
    /// The request did not complete within its deadline.
    #[error("Template request timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    /// The executor was closed while the request was outstanding.
    #[error("Template executor is closed")]
    Closed,
    /// The encoded request does not fit into the transport.
    #[error("Frame of {size} bytes exceeds transport capacity of {capacity} bytes")]
    FrameTooLarge { size: usize, capacity: usize },
    /// JSON encoding or decoding failed.
    #[error("JSON serialization/deserialization failed: {source}")]
    SerdeJson {
        #[source]
        source: serde_json::Error,
    },
    /// Configuration could not be loaded.
    #[error("Failed to load configuration: {source}")]
    Config {
        #[source]
        source: config::ConfigError,
    },
    /// Input/output operation failed.
    #[error("IO operation failed: {source}")]
    IO {
        #[source]
        source: std::io::Error,
    },
    /// No template is registered under the requested name.
    #[error("Template {name} is not registered")]
    UnknownTemplate { name: String },
    /// Required builder attribute was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

impl Error {
    /// Classification label reported to the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Compilation { .. } => "compilation",
            Error::Spawn { .. } => "spawn",
            Error::Handshake { .. } => "handshake",
            Error::RespawnExhausted { .. } => "respawn_exhausted",
            Error::Evaluation { .. } => "evaluation",
            Error::Transport { .. } => "transport",
            Error::WorkerLost { .. } => "worker_lost",
            Error::Timeout { .. } => "timeout",
            Error::Closed => "closed",
            Error::FrameTooLarge { .. } => "frame_too_large",
            Error::SerdeJson { .. } => "serialization",
            Error::Config { .. } => "config",
            Error::IO { .. } => "io",
            Error::UnknownTemplate { .. } => "unknown_template",
            Error::MissingRequiredAttribute(_) => "missing_attribute",
        }
    }

    /// Whether another spawn attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Spawn { .. } | Error::Handshake { .. } | Error::Transport { .. } | Error::IO { .. }
        )
    }

    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        Error::Evaluation {
            message: message.into(),
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }
}
