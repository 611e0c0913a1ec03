use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the durable request count state.
///
/// Every variant is fatal for the daemon: it must neither start serving with
/// unknown counters nor keep running once the on-disk copy can go stale.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("request count file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("could not read the request count file {path}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write the request count file {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

impl CounterError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn persist(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Persist {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
