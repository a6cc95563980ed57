//! State errors

use obelisk_consensus::ConsensusError;
use obelisk_storage::StorageError;
use thiserror::Error;

/// State result type
pub type StateResult<T> = Result<T, StateError>;

/// State errors
#[derive(Error, Debug)]
pub enum StateError {
    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transaction or box failed a consensus-level check
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Insert of a key already present in the tree
    #[error("Duplicate key in tree: {0}")]
    DuplicateKey(String),

    /// Remove or lookup of a key absent from the tree
    #[error("Key not found in tree: {0}")]
    KeyNotFound(String),

    /// Referenced input box does not exist in the state
    #[error("Box not found: {0}")]
    BoxNotFound(String),

    /// Transaction spends more than it unlocks
    #[error("Balance violation: debit {debit} < credit {credit}")]
    BalanceViolation { debit: u64, credit: u64 },

    /// Post-application digest disagrees with the header commitment
    #[error("State root mismatch for block {modifier}: expected {expected}, got {actual}")]
    RootMismatch {
        modifier: String,
        expected: String,
        actual: String,
    },

    /// Serialized proof digest disagrees with the header commitment
    #[error("AD proof mismatch for block {0}")]
    AdProofMismatch(String),

    /// Rollback target digest was never committed or has been evicted
    #[error("Unknown rollback version: {0}")]
    UnknownRollbackVersion(String),

    /// Rollback target is beyond the permitted depth
    #[error("Rollback too deep: {depth} > {max}")]
    RollbackTooDeep { depth: usize, max: usize },

    /// Persisted tree node is missing or malformed
    #[error("Corrupted tree node: {0}")]
    CorruptedNode(String),
}
