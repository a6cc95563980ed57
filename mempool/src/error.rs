//! Mempool errors

use thiserror::Error;

/// Mempool result type
pub type MempoolResult<T> = Result<T, MempoolError>;

/// Mempool errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MempoolError {
    /// Every transaction of a batch was invalid, duplicate or truncated
    #[error("no transaction was admitted")]
    NothingAdmitted,
}
