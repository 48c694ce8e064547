//! Error types for the flow execution engine

/// Rejected run requests. Raised before any worker is spawned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ccu must be at least 1, got {0}")]
    InvalidCcu(usize),

    #[error("threads must be within [{min}, {max}], got {got}")]
    InvalidThreads { got: usize, min: usize, max: usize },

    #[error("duration must be at least {min}s, got {got}s")]
    InvalidDuration { got: u64, min: u64 },

    #[error("flow has no steps")]
    EmptyFlow,
}

/// A single step could not be turned into a request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Missing value for URL parameter: {0}")]
    MissingPathParam(String),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
}

/// Failures of a worker's own control loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("coordinator channel closed")]
    ChannelClosed,
}

/// Failures while handing records to an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
