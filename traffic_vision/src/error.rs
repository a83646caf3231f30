// THEORY:
// Every failure the engine can report is synchronous and goes straight back to
// the caller of the operation that triggered it. Nothing here is process-fatal and
// nothing is retried automatically. The only "soft" failure, an unresolved model
// profile, never leaves the simulator: a tick that cannot resolve its model is
// skipped and the previous track set is kept.

use std::path::PathBuf;

/// Errors returned by the stream manager and the session recorder.
#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    /// A start was requested while all slots are occupied.
    #[error("all {capacity} stream slots are in use; stop a stream to add a new one")]
    CapacityExceeded { capacity: usize },

    /// A start was requested with a blank source reference.
    #[error("source reference is empty")]
    EmptySource,

    /// A start was requested with a local file whose handle was already released.
    #[error("local source {} was already released", path.display())]
    ReleasedSource { path: PathBuf },

    /// A slot index outside `0..capacity`.
    #[error("slot index {index} is out of range (capacity {capacity})")]
    InvalidSlot { index: usize, capacity: usize },

    /// A setting value outside its accepted range.
    #[error("{setting} = {value} is outside {min}..={max}")]
    OutOfRange {
        setting: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// Stop-all or session capture with nothing running.
    #[error("no active streams")]
    NoActiveStreams,

    #[error("session name is empty")]
    EmptySessionName,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised inside a single simulator tick. Never surfaced past the worker.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SimulationError {
    #[error("model profile {name:?} is not in the catalog")]
    MissingModelProfile { name: String },
}

/// Failures of the key-value session persistence boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session store holds malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors produced while loading or validating a [`crate::config::DashboardConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = DashboardError> = std::result::Result<T, E>;
