// Error types for training, checkpointing and metrics
//
// Library code returns `TrainError`; the binary wraps it with anyhow and
// uses the helpers at the bottom to print actionable messages.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("incompatible checkpoint {}: {reason}", .path.display())]
    IncompatibleCheckpoint { path: PathBuf, reason: String },

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("metric '{0}' has no updates since the last reset")]
    EmptyMetric(String),

    #[error("invalid lr schedule: {0}")]
    InvalidSchedule(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("joint step out of order: {0}")]
    StepOrder(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("data error: {0}")]
    Data(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl TrainError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn incompatible(path: &Path, reason: impl Into<String>) -> Self {
        Self::IncompatibleCheckpoint {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Format a missing resume checkpoint with helpful suggestions
pub fn checkpoint_not_found_error(path: &Path) -> String {
    format!(
        "Resume checkpoint not found: {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Wrong run id in the resume path\n\
        • Checkpoint directory was moved or cleaned up\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. List saved runs:\n\
           \x1b[36mls {}\x1b[0m\n\n\
        2. Start a fresh run by clearing `resume` in the config",
        path.display(),
        path.parent()
            .and_then(Path::parent)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string())
    )
}

/// Format a config parse error with helpful suggestions
pub fn config_parse_error(path: &Path, error: &str) -> String {
    format!(
        "Failed to parse config file {}\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check the TOML syntax (quotes around strings, closed brackets)\n\
        2. Remove unknown keys; every section is optional and has defaults",
        path.display(),
        error
    )
}
