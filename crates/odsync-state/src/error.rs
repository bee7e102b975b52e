use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Fs(#[from] odsync_fs::Error),

    #[error("failed to encode sidecar")]
    Encode(#[from] serde_json::Error),

    #[error("invalid bitmap: {reason}")]
    InvalidBitmap { reason: String },

    #[error("no partial file to commit at {}", path.display())]
    MissingPartial { path: PathBuf },

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}
