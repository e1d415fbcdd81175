//! Error types for the run queue engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Cancellation error: {0}")]
    Cancel(#[from] CancelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Submission validation errors. These abort submission before any task
/// record exists.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed argument document: {0}")]
    MalformedArgDocument(String),

    #[error("Placeholder <file{index}> out of range: {uploaded} file(s) uploaded")]
    PlaceholderOutOfRange { index: usize, uploaded: usize },

    #[error("Invalid script name {name:?}: only letters, digits, '_' and '-' are allowed")]
    InvalidScriptName { name: String },
}

/// Lookup failures for scripts and tasks.
#[derive(Debug, thiserror::Error)]
pub enum NotFoundError {
    #[error("Script {name} not found")]
    Script { name: String },

    #[error("Task {id} not found")]
    Task { id: Uuid },
}

/// Task store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task {id} not found in store")]
    NotFound { id: Uuid },

    #[error("Task {id} already exists")]
    Duplicate { id: Uuid },

    #[error("Invalid status transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Subprocess errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process for task {id}: {reason}")]
    Spawn { id: Uuid, reason: String },

    #[error("Failed to wait on process for task {id}: {reason}")]
    Wait { id: Uuid, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cancellation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CancelError {
    #[error("Task {id} did not terminate within {grace:?} after forceful kill: {reason}")]
    TerminationTimeout {
        id: Uuid,
        grace: Duration,
        reason: String,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
