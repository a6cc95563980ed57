//! OBELISK Node Components
//!
//! The chain-facing half of the node: the header processor that orders
//! headers, selects the best chain and computes required difficulty, and
//! the miner that assembles candidates from the mempool and searches for
//! proof-of-work. Node settings for both live here as well.

pub mod chain;
mod error;
pub mod miner;
pub mod settings;

pub use chain::{HeaderProcessor, ProgressInfo, Validity};
pub use error::{ChainError, ChainResult};
pub use miner::{
    LocallyGeneratedModifier, Miner, MinerCommand, MinerHandle, MinerState,
};
pub use settings::{
    ChainSettings, CoreSettings, MinerSettings, NodeSettings, PoolSettings, SettingsError,
    StateMode,
};
