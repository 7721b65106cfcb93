//! Error types for convergence
//!
//! Contract violations (revision regression, malformed graphs) are fatal to
//! the call that triggered them. Per-clip and per-plugin preparation failures
//! never surface here: the desired-state builder logs them and moves on.

use thiserror::Error;

/// Errors raised while converging the engine on a session
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("session revision regressed: last applied {last_applied}, got {incoming}")]
    RevisionRegression { last_applied: u64, incoming: u64 },

    #[error("track {track_id} has no routing graph")]
    MissingRoutingGraph { track_id: String },

    #[error("routing graph for track {track_id} is invalid: {reason}")]
    InvalidGraph { track_id: String, reason: String },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("engine {operation} failed: {source:#}")]
    Engine {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin instance {instance_id}: {source:#}")]
    Plugin {
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no recovery state for plugin instance {0}")]
    UnknownInstance(String),
}

impl SyncError {
    pub(crate) fn engine(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Engine { operation, source }
    }

    pub(crate) fn plugin(instance_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Plugin {
            instance_id: instance_id.into(),
            source,
        }
    }

    /// Contract violations are caller bugs, not transient engine trouble.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SyncError::RevisionRegression { .. }
                | SyncError::MissingRoutingGraph { .. }
                | SyncError::InvalidGraph { .. }
        )
    }
}

/// Errors from loading, validating, or uploading a clip buffer.
///
/// Cloneable so every waiter on a shared in-flight upload sees the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("failed to load {path}: {message}")]
    Load { path: String, message: String },

    #[error("malformed audio in {path}: {reason}")]
    Geometry { path: String, reason: String },

    #[error("upload of buffer {key} failed: {message}")]
    Upload { key: String, message: String },
}
