//! Error type shared by trainers, sinks and checkpointing.
//!
//! Only recoverable-by-caller failures live here. Broken data or structural
//! invariants (label sets, parameter layouts, shapes) panic at the point of
//! detection with a message naming the violated invariant.

use std::path::PathBuf;

use burn::record::RecorderError;

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("checkpoint I/O failed for {}: {source}", .path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainerError>;
