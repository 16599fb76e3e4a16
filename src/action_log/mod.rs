//! Persisted log of every reporting decision.
//!
//! The log is the only source of truth for cooldowns: nothing about past
//! decisions is kept in memory across restarts.

pub mod csv;
pub mod entry;
pub mod store;

pub use entry::{ActionLogEntry, LogAction};
pub use store::{ActionLogStore, AppendOutcome};

/// Error from the action log store.
#[derive(Debug)]
pub enum LogStoreError {
    /// Reading or writing the backing file failed.
    Io(std::io::Error),
    /// A previous holder of the store lock panicked.
    LockPoisoned,
}

impl std::fmt::Display for LogStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStoreError::Io(e) => write!(f, "action log IO error: {}", e),
            LogStoreError::LockPoisoned => write!(f, "action log lock poisoned"),
        }
    }
}

impl std::error::Error for LogStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogStoreError::Io(e) => Some(e),
            LogStoreError::LockPoisoned => None,
        }
    }
}

impl From<std::io::Error> for LogStoreError {
    fn from(e: std::io::Error) -> Self {
        LogStoreError::Io(e)
    }
}
