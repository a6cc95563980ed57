//! Consensus errors

use thiserror::Error;

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Consensus-level validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsensusError {
    /// Signature does not verify against the declared key
    #[error("invalid signature")]
    InvalidSignature,

    /// Public key bytes do not decode to a valid key
    #[error("malformed public key")]
    MalformedKey,

    /// Stored box bytes carry an unknown type discriminant
    #[error("unknown box type: {0}")]
    UnknownBoxType(u8),

    /// Stored box bytes are truncated or malformed
    #[error("malformed box bytes: {0}")]
    MalformedBox(String),

    /// Transaction creates no boxes
    #[error("transaction has no outputs")]
    EmptyOutputs,

    /// Non-coinbase transaction spends no boxes
    #[error("transaction has no unlockers")]
    EmptyUnlockers,

    /// Transaction references the same box twice
    #[error("duplicate input box {0}")]
    DuplicateInput(String),

    /// Transaction carries a zero timestamp
    #[error("transaction timestamp is zero")]
    ZeroTimestamp,

    /// Box unlock attempt failed
    #[error("unlock failed for box {0}: {1}")]
    UnlockFailed(String, String),

    /// Open box spent below its unlock height
    #[error("box locked until height {required}, current height {current}")]
    HeightLock { required: u64, current: u64 },
}
