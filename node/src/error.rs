//! Chain processing errors

use obelisk_storage::StorageError;
use thiserror::Error;

/// Chain result type
pub type ChainResult<T> = Result<T, ChainError>;

/// Header validation and processing errors
#[derive(Error, Debug)]
pub enum ChainError {
    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Header record failed to decode
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Header was already processed
    #[error("Header already known: {0}")]
    AlreadyKnown(String),

    /// Second genesis, or genesis at the wrong height
    #[error("Invalid genesis header {id}: {reason}")]
    InvalidGenesis { id: String, reason: String },

    /// Parent header is unknown
    #[error("Parent {parent} of header {id} is unknown")]
    ParentMissing { id: String, parent: String },

    /// Height does not follow the parent
    #[error("Header {id} height {got}, expected {expected}")]
    WrongHeight { id: String, got: u64, expected: u64 },

    /// Timestamp too far in the future
    #[error("Header {id} timestamp {timestamp} drifts {drift} ms past now")]
    TimestampDrift {
        id: String,
        timestamp: u64,
        drift: u64,
    },

    /// Timestamp precedes the parent's
    #[error("Header {id} timestamp precedes its parent")]
    TimestampBeforeParent { id: String },

    /// Declared difficulty below the required difficulty
    #[error("Header {id} difficulty {got} below required {required}")]
    InsufficientDifficulty {
        id: String,
        got: u128,
        required: u128,
    },

    /// Proof-of-work check failed
    #[error("Header {id} fails the proof-of-work check")]
    PowInvalid { id: String },

    /// Parent is deeper than the permitted rollback
    #[error("Header {id} builds on a parent {depth} blocks behind the best header")]
    ForkTooDeep { id: String, depth: u64 },

    /// Miner signature check failed
    #[error("Header {id} carries an invalid signature")]
    BadSignature { id: String },

    /// No chain tip to mine on
    #[error("No best header and offline generation is disabled")]
    NoTipToMineOn,
}

impl From<bincode::Error> for ChainError {
    fn from(e: bincode::Error) -> Self {
        ChainError::Serialization(e.to_string())
    }
}
