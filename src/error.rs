//! Error types for the Hurricore training engine

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for Hurricore operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction arguments, raised before any step runs
    #[error("Configuration error: {0}")]
    Config(String),

    /// The per-step computation (loss, backward, optimizer step) failed
    #[error("Training step failed at epoch {epoch}, step {global_step}: {source}")]
    TrainingStep {
        /// Epoch in which the step failed
        epoch: usize,
        /// Global step that failed
        global_step: usize,
        /// Underlying failure
        #[source]
        source: anyhow::Error,
    },

    /// A hook marked as critical failed
    #[error("Hook '{hook}' failed: {source}")]
    Hook {
        /// Name of the failing hook
        hook: String,
        /// Underlying failure
        #[source]
        source: anyhow::Error,
    },

    /// A checkpoint directory could not be fully deserialized
    #[error("Corrupted checkpoint at {}: {reason}", path.display())]
    CheckpointCorruption {
        /// Checkpoint directory
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Hurricore operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint corruption error
    pub fn checkpoint_corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error was raised while validating construction arguments
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = Error::config("interval must be > 0");
        assert!(err.is_config());
        assert_eq!(err.to_string(), "Configuration error: interval must be > 0");
    }

    #[test]
    fn test_checkpoint_corruption_message() {
        let err = Error::checkpoint_corruption("/tmp/ckpt_step_5", "missing manifest");
        assert!(!err.is_config());
        assert!(err.to_string().contains("ckpt_step_5"));
        assert!(err.to_string().contains("missing manifest"));
    }
}
