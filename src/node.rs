//! Node view
//!
//! Ties the header processor, the UTXO state and the mempool together.
//! Modifiers — network-received or locally mined — enter through the
//! node view, which orders them via `ProgressInfo`, applies blocks to
//! the state in that order (rolling back to the branch point first on a
//! reorg), prunes included transactions from the mempool, and feeds
//! chain-tip changes to the miner.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use obelisk_consensus::{
    AdProofs, Block, Header, NetworkTime, Payload, SystemClock, Transaction, TxId,
};
use obelisk_mempool::{Mempool, MempoolConfig};
use obelisk_node::{
    ChainError, HeaderProcessor, LocallyGeneratedModifier, MinerCommand, MinerHandle,
    MinerState, NodeSettings, ProgressInfo,
};
use obelisk_state::{StateError, UtxoState};
use obelisk_storage::{StorageError, VersionedStore};

/// Node view result type
pub type NodeResult<T> = Result<T, NodeError>;

/// Node view errors
#[derive(Debug, Error)]
pub enum NodeError {
    /// Chain-level failure
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// State-level failure
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Mempool failure
    #[error("Mempool error: {0}")]
    Mempool(#[from] obelisk_mempool::MempoolError),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A block section needed for application has not been downloaded
    #[error("Missing section {0} for block application")]
    MissingSection(String),
}

impl From<bincode::Error> for NodeError {
    fn from(e: bincode::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

/// InfoApiRoute-style status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Best header identifier
    pub best_header_id: Option<String>,
    /// Best fully-applied block identifier
    pub best_block_id: Option<String>,
    /// Current state version
    pub state_version: String,
    /// Current state height
    pub state_height: Option<u64>,
    /// Pooled transaction count
    pub mempool_size: usize,
    /// Miner state
    pub miner_state: String,
}

/// The node view over the core components
pub struct NodeView {
    settings: NodeSettings,
    chain: Arc<HeaderProcessor>,
    state: Arc<RwLock<UtxoState>>,
    mempool: Mempool,
    cleanup: Option<JoinHandle<()>>,
}

impl NodeView {
    /// Open the node view over a data directory, creating the chain and
    /// state stores inside it.
    pub fn open(data_dir: &Path, settings: NodeSettings) -> NodeResult<Self> {
        Self::open_with_clock(data_dir, settings, Arc::new(SystemClock))
    }

    /// Open with an explicit time source
    pub fn open_with_clock(
        data_dir: &Path,
        settings: NodeSettings,
        clock: Arc<dyn NetworkTime>,
    ) -> NodeResult<Self> {
        let chain_store = Arc::new(VersionedStore::open(data_dir.join("chain.db"))?);
        let state_store = Arc::new(VersionedStore::open(data_dir.join("state.db"))?);

        let chain = Arc::new(HeaderProcessor::new(
            chain_store,
            settings.chain.clone(),
            settings.node.clone(),
            clock.clone(),
        ));
        let state = UtxoState::open(state_store)?;
        let mempool = Mempool::with_clock(
            MempoolConfig {
                max_capacity: settings.mempool.max_capacity,
                utx_max_age: settings.mempool.utx_max_age(),
                cleanup_interval: settings.mempool.cleanup_interval(),
            },
            clock,
        );

        info!(
            best_header = ?chain.best_header_id()?,
            state_height = ?state.height(),
            "Opened node view"
        );
        Ok(Self {
            settings,
            chain,
            state: Arc::new(RwLock::new(state)),
            mempool,
            cleanup: None,
        })
    }

    /// The header processor
    pub fn chain(&self) -> &Arc<HeaderProcessor> {
        &self.chain
    }

    /// Shared handle onto the UTXO state
    pub fn state(&self) -> &Arc<RwLock<UtxoState>> {
        &self.state
    }

    /// The mempool
    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// The node settings
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Start the mempool expiry sweep. Idempotent.
    pub fn start_cleanup(&mut self) {
        if self.cleanup.is_none() {
            self.cleanup = Some(self.mempool.spawn_cleanup());
        }
    }

    /// Tear the node view down, cancelling the cleanup task
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }

    /// Submit a user transaction to the mempool
    pub fn submit_transaction(&self, tx: Transaction) -> NodeResult<()> {
        Ok(self.mempool.put(tx)?)
    }

    /// Ingest a full block: validate and process the header, persist the
    /// sections, and — when the best chain advanced and the node
    /// verifies transactions — apply the affected blocks to the state in
    /// `ProgressInfo` order.
    pub fn process_block(&self, block: &Block) -> NodeResult<ProgressInfo> {
        self.chain.validate(&block.header)?;
        let progress = self.chain.process(&block.header)?;

        self.chain.put_section_bytes(
            &block.header.payload_id,
            bincode::serialize(&block.payload)?,
        )?;
        if let Some(proofs) = &block.ad_proofs {
            self.chain
                .put_section_bytes(&block.header.ad_proofs_id, bincode::serialize(proofs)?)?;
        }

        if progress.best_header.is_some() {
            if self.settings.node.verify_transactions {
                self.apply_progress(&progress, block)?;
            } else {
                // Digest regime: advance the version without replaying.
                let mut state = self.state.write();
                for header in &progress.to_apply {
                    *state = state.apply_header(header);
                }
            }
        }

        self.chain.clean()?;
        self.state
            .read()
            .clean(self.settings.node.keep_versions)?;
        Ok(progress)
    }

    /// Apply the blocks named by a `ProgressInfo`, rolling the state
    /// back to the branch point first.
    fn apply_progress(&self, progress: &ProgressInfo, incoming: &Block) -> NodeResult<()> {
        if let Some(branch) = progress.rollback_to {
            let rolled = self.state.read().rollback_to(branch)?;
            *self.state.write() = rolled;
            info!(branch = %branch, "State rolled back for reorg");
        }

        for header in &progress.to_apply {
            let block = if header.id() == incoming.id() {
                incoming.clone()
            } else {
                self.load_block(header)?
            };

            let applied = self.state.read().apply_block(&block);
            match applied {
                Ok((next, proofs)) => {
                    *self.state.write() = next;
                    self.chain.mark_valid(&block.id())?;
                    self.chain.update_best_block(&block.id())?;
                    if block.ad_proofs.is_none() {
                        // The node produced the proofs itself; keep them
                        // available for peers.
                        self.chain.put_section_bytes(
                            &block.header.ad_proofs_id,
                            bincode::serialize(&proofs)?,
                        )?;
                    }
                    self.prune_included(&block);
                }
                Err(e) => {
                    warn!(block = %block.id(), error = %e, "Block application failed");
                    self.chain.report_invalid(&block.header)?;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Reassemble a block from its stored sections
    fn load_block(&self, header: &Header) -> NodeResult<Block> {
        let payload_bytes = self
            .chain
            .section_bytes(&header.payload_id)?
            .ok_or_else(|| NodeError::MissingSection(header.payload_id.to_hex()))?;
        let payload: Payload = bincode::deserialize(&payload_bytes)?;

        let ad_proofs = match self.chain.section_bytes(&header.ad_proofs_id)? {
            Some(bytes) => Some(bincode::deserialize::<AdProofs>(&bytes)?),
            None => None,
        };
        Ok(Block::new(header.clone(), payload, ad_proofs))
    }

    /// Drop the transactions a block confirmed from the mempool
    fn prune_included(&self, block: &Block) {
        let included: HashSet<TxId> = block
            .payload
            .transactions
            .iter()
            .map(Transaction::id)
            .collect();
        if !included.is_empty() {
            self.mempool.filter(|tx| !included.contains(&tx.id()));
        }
    }

    /// Consume the miner's locally generated modifiers, reassembling
    /// header + payload (+ AD proofs) into blocks, feeding them through
    /// the node view and notifying the miner of the new tip.
    pub async fn run_local_modifiers(
        &self,
        mut modifiers: mpsc::Receiver<LocallyGeneratedModifier>,
        miner: MinerHandle,
    ) {
        let mut pending_header: Option<Header> = None;
        let mut pending_payload: Option<Payload> = None;

        while let Some(modifier) = modifiers.recv().await {
            match modifier {
                LocallyGeneratedModifier::Header(header) => {
                    pending_header = Some(*header);
                    pending_payload = None;
                }
                LocallyGeneratedModifier::Payload(payload) => {
                    pending_payload = Some(payload);
                }
                LocallyGeneratedModifier::AdProofs(proofs) => {
                    let (Some(header), Some(payload)) =
                        (pending_header.take(), pending_payload.take())
                    else {
                        warn!("AD proofs arrived without a pending block");
                        continue;
                    };
                    let block = Block::new(header, payload, Some(proofs));
                    match self.process_block(&block) {
                        Ok(_) => {
                            miner
                                .send(MinerCommand::BlockArrived(Box::new(block.header)))
                                .await;
                        }
                        Err(e) => warn!(block = %block.id(), error = %e, "Mined block rejected"),
                    }
                }
            }
        }
    }

    /// Status snapshot for the info surface
    pub fn status(&self, miner: Option<&MinerHandle>) -> NodeResult<StatusReport> {
        let state = self.state.read();
        Ok(StatusReport {
            best_header_id: self.chain.best_header_id()?.map(|id| id.to_hex()),
            best_block_id: self.chain.best_block_id()?.map(|id| id.to_hex()),
            state_version: state.version().to_hex(),
            state_height: state.height(),
            mempool_size: self.mempool.len(),
            miner_state: match miner.map(MinerHandle::state) {
                Some(MinerState::Running) => "running".into(),
                Some(MinerState::Idle) => "idle".into(),
                None => "disabled".into(),
            },
        })
    }

    /// Status snapshot as JSON
    pub fn status_json(&self, miner: Option<&MinerHandle>) -> NodeResult<String> {
        let report = self.status(miner)?;
        serde_json::to_string_pretty(&report).map_err(|e| NodeError::Serialization(e.to_string()))
    }
}

impl Drop for NodeView {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obelisk_node::StateMode;

    #[test]
    fn test_status_report_serializes() {
        let report = StatusReport {
            best_header_id: Some("aa".repeat(32)),
            best_block_id: None,
            state_version: "00".repeat(32),
            state_height: Some(4),
            mempool_size: 2,
            miner_state: "idle".into(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"mempool_size\":2"));
        assert!(json.contains("best_header_id"));
    }

    #[test]
    fn test_digest_mode_settings_round_trip() {
        let mut settings = NodeSettings::default();
        settings.node.state_mode = StateMode::Digest;
        settings.node.verify_transactions = false;
        settings.node.blocks_to_keep = 0;
        assert!(settings.validate().is_ok());
    }
}
