use thiserror::Error;

/// Recoverable outcomes of a merge. Everything else is an invariant
/// violation and panics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    /// The output would not fit on disk; the inputs stay as they are.
    #[error("not enough free disk space: need {needed} bytes, {available} bytes available")]
    NoDiskSpace { needed: u64, available: u64 },

    /// The partition is shutting down; partial output was discarded.
    #[error("merge stopped")]
    Stopped,
}
