//! Node settings
//!
//! TOML-backed configuration with per-section defaults. Every option the
//! core recognises lives here; `validate` enforces the cross-field
//! constraints.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use obelisk_consensus::{EmissionSchedule, LinearDifficultyController};

/// Configuration errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How the node keeps its UTXO set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateMode {
    /// Full box storage
    Utxo,
    /// Digest only; transactions validate through supplied AD proofs
    Digest,
}

/// Core node behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// UTXO or digest state regime
    pub state_mode: StateMode,
    /// Replay block transactions against the state
    pub verify_transactions: bool,
    /// Retention window for full blocks; -1 keeps all
    pub blocks_to_keep: i64,
    /// Version history length handed to the storage `clean`
    pub keep_versions: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            state_mode: StateMode::Utxo,
            verify_transactions: true,
            blocks_to_keep: -1,
            keep_versions: 200,
        }
    }
}

/// Consensus-chain parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    /// Difficulty of the first blocks and the retarget fallback
    pub initial_difficulty: u128,
    /// Blocks per retargeting epoch
    pub epoch_length: u64,
    /// Samples in the retargeting window
    pub retargeting_epochs_qty: usize,
    /// Desired block interval in milliseconds
    pub desired_block_interval_ms: u64,
    /// Permitted future drift of header timestamps, in milliseconds
    pub max_time_drift_ms: u64,
    /// Deepest fork a new header may build on
    pub max_rollback_depth: u64,
    /// Reward of the first emission interval
    pub emission_initial_reward: u64,
    /// Blocks between reward halvings
    pub emission_halving_interval: u64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            initial_difficulty: 1_000,
            epoch_length: 100,
            retargeting_epochs_qty: 4,
            desired_block_interval_ms: 30_000,
            max_time_drift_ms: 90_000,
            max_rollback_depth: 100,
            emission_initial_reward: 5_000_000_000,
            emission_halving_interval: 210_000,
        }
    }
}

impl ChainSettings {
    /// Difficulty controller configured from these settings
    pub fn difficulty_controller(&self) -> LinearDifficultyController {
        LinearDifficultyController {
            epoch_length: self.epoch_length,
            retargeting_epochs_qty: self.retargeting_epochs_qty,
            desired_block_interval_ms: self.desired_block_interval_ms,
            initial_difficulty: self.initial_difficulty,
        }
    }

    /// Emission schedule configured from these settings
    pub fn emission_schedule(&self) -> EmissionSchedule {
        EmissionSchedule {
            initial_reward: self.emission_initial_reward,
            halving_interval: self.emission_halving_interval,
        }
    }
}

/// Mempool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Cap on pooled transactions
    pub max_capacity: usize,
    /// Expiry age in minutes
    pub utx_max_age_min: u64,
    /// Expiry sweep period in minutes
    pub cleanup_interval_min: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            utx_max_age_min: 1_000,
            cleanup_interval_min: 180,
        }
    }
}

impl PoolSettings {
    /// Expiry age as a duration
    pub fn utx_max_age(&self) -> Duration {
        Duration::from_secs(self.utx_max_age_min * 60)
    }

    /// Sweep period as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_min * 60)
    }
}

/// Miner behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerSettings {
    /// Mine at all
    pub mining: bool,
    /// Permit mining without a peer-observed tip
    pub offline_generation: bool,
    /// Pause between attempts after a mined block, in seconds
    pub mining_delay_secs: u64,
    /// Serialized-size cap for candidate payloads
    pub block_max_size: usize,
}

impl Default for MinerSettings {
    fn default() -> Self {
        Self {
            mining: false,
            offline_generation: false,
            mining_delay_secs: 10,
            block_max_size: 512 * 1024,
        }
    }
}

impl MinerSettings {
    /// Inter-attempt pause as a duration
    pub fn mining_delay(&self) -> Duration {
        Duration::from_secs(self.mining_delay_secs)
    }
}

/// Full node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Core node behaviour
    #[serde(default)]
    pub node: CoreSettings,

    /// Consensus-chain parameters
    #[serde(default)]
    pub chain: ChainSettings,

    /// Mempool limits
    #[serde(default)]
    pub mempool: PoolSettings,

    /// Miner behaviour
    #[serde(default)]
    pub miner: MinerSettings,
}

impl NodeSettings {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.node.verify_transactions && self.node.blocks_to_keep != 0 {
            return Err(SettingsError::Invalid(
                "blocks_to_keep must be 0 when verify_transactions is disabled".into(),
            ));
        }
        if self.chain.initial_difficulty == 0 {
            return Err(SettingsError::Invalid(
                "initial_difficulty must be positive".into(),
            ));
        }
        if self.chain.epoch_length == 0 {
            return Err(SettingsError::Invalid("epoch_length must be positive".into()));
        }
        Ok(())
    }
}
