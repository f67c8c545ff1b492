//! Error types for stackfs

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the union core
#[derive(Debug, Error)]
pub enum Error {
    /// Cached generation no longer matches; redo the lookup
    #[error("stale generation: cached {cached}, current {current}")]
    StaleGeneration { cached: u32, current: u32 },

    /// Pin revalidation found the target moved; restart the operation
    #[error("concurrent modification on branch {bindex}: {reason}")]
    ConcurrentModification { bindex: usize, reason: String },

    /// Shadow table could not grow; table left unchanged
    #[error("failed to allocate shadow table for {requested} branches")]
    AllocationFailure { requested: usize },

    /// Branch refused a mount-write token
    #[error("branch {bindex} is read-only")]
    ReadOnlyBranch { bindex: usize },

    /// Inode number remap space is exhausted
    #[error("inode number space exhausted (max {max})")]
    IdentityOverflow { max: u64 },

    /// Pin used out of its state machine order
    #[error("invalid pin state: {0}")]
    InvalidPinState(String),

    #[error("branch index {0} out of range")]
    BranchNotFound(usize),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Pseudo-links were still registered at teardown
    #[error("{count} pseudo-link(s) still registered")]
    PseudoLinkLeak { count: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn busy(bindex: usize, reason: impl Into<String>) -> Self {
        Error::ConcurrentModification {
            bindex,
            reason: reason.into(),
        }
    }

    /// Whether the caller may redo the lookup or operation and expect success
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StaleGeneration { .. } | Error::ConcurrentModification { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::StaleGeneration { cached: 1, current: 2 }.is_retryable());
        assert!(Error::busy(0, "moved").is_retryable());
        assert!(!Error::ReadOnlyBranch { bindex: 1 }.is_retryable());
        assert!(!Error::IdentityOverflow { max: 10 }.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::AllocationFailure { requested: 7 };
        assert_eq!(err.to_string(), "failed to allocate shadow table for 7 branches");
    }
}
