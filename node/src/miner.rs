//! Miner
//!
//! A command-driven worker that assembles candidate blocks from the
//! mempool and the UTXO state, searches nonces against the required
//! difficulty, and publishes winning blocks as locally generated
//! modifiers. Attempts are self-scheduled through the command channel,
//! so `StopMining` takes effect between attempts.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use obelisk_consensus::{
    validate_pow, AdProofs, Block, EmissionSchedule, Header, NetworkTime, Payload, StateBox,
    StateDigest, Transaction, Unlocker, GENESIS_HEIGHT, GENESIS_PARENT_ID,
};
use obelisk_consensus::boxes::CoinbaseBox;
use obelisk_consensus::types::{Difficulty, Height};
use obelisk_mempool::Mempool;
use obelisk_state::UtxoState;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain::HeaderProcessor;
use crate::error::{ChainError, ChainResult};
use crate::settings::MinerSettings;

/// Pause before retrying when no candidate exists yet
const NO_CANDIDATE_RETRY: Duration = Duration::from_secs(1);

/// Commands and notifications the miner reacts to
#[derive(Debug, Clone)]
pub enum MinerCommand {
    /// Begin mining, if enabled
    StartMining,
    /// Stop scheduling attempts
    StopMining,
    /// Perform one proof-of-work attempt
    MineBlock,
    /// A semantically successful block arrived on the node
    BlockArrived(Box<Header>),
}

/// Miner lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Running,
}

/// A block-like modifier produced locally, to be fed back into the node
/// view like any network modifier.
#[derive(Debug, Clone)]
pub enum LocallyGeneratedModifier {
    Header(Box<Header>),
    Payload(Payload),
    AdProofs(AdProofs),
}

/// Candidate block awaiting a winning nonce
#[derive(Debug, Clone)]
struct CandidateBlock {
    parent: Option<Header>,
    ad_proof: Vec<u8>,
    ad_digest: StateDigest,
    transactions: Vec<Transaction>,
    timestamp: u64,
    difficulty: Difficulty,
}

/// Shared read handle onto the miner state
#[derive(Clone)]
pub struct MinerHandle {
    state: Arc<RwLock<MinerState>>,
    commands: mpsc::Sender<MinerCommand>,
}

impl MinerHandle {
    /// Current miner state
    pub fn state(&self) -> MinerState {
        *self.state.read()
    }

    /// Queue a command for the miner
    pub async fn send(&self, command: MinerCommand) {
        let _ = self.commands.send(command).await;
    }
}

/// The mining worker
pub struct Miner {
    settings: MinerSettings,
    key: SigningKey,
    chain: Arc<HeaderProcessor>,
    state_view: Arc<RwLock<UtxoState>>,
    mempool: Mempool,
    emission: EmissionSchedule,
    clock: Arc<dyn NetworkTime>,

    status: Arc<RwLock<MinerState>>,
    candidate: Option<CandidateBlock>,
    nonce: u64,
    started_at: u64,

    commands_tx: mpsc::Sender<MinerCommand>,
    outbound: mpsc::Sender<LocallyGeneratedModifier>,
}

impl Miner {
    /// Create a miner together with its command handle. The key is the
    /// node wallet's first key, chosen deterministically.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: MinerSettings,
        key: SigningKey,
        chain: Arc<HeaderProcessor>,
        state_view: Arc<RwLock<UtxoState>>,
        mempool: Mempool,
        emission: EmissionSchedule,
        clock: Arc<dyn NetworkTime>,
        outbound: mpsc::Sender<LocallyGeneratedModifier>,
    ) -> (Self, MinerHandle, mpsc::Receiver<MinerCommand>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let status = Arc::new(RwLock::new(MinerState::Idle));
        let handle = MinerHandle {
            state: status.clone(),
            commands: commands_tx.clone(),
        };
        let started_at = clock.now_millis();
        let miner = Self {
            settings,
            key,
            chain,
            state_view,
            mempool,
            emission,
            clock,
            status,
            candidate: None,
            nonce: 0,
            started_at,
            commands_tx,
            outbound,
        };
        (miner, handle, commands_rx)
    }

    /// Run the miner until its command channel closes
    pub async fn run(mut self, mut commands: mpsc::Receiver<MinerCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                MinerCommand::StartMining => self.on_start().await,
                MinerCommand::StopMining => {
                    info!("Miner stopping");
                    *self.status.write() = MinerState::Idle;
                }
                MinerCommand::BlockArrived(header) => self.on_block_arrived(*header).await,
                MinerCommand::MineBlock => self.on_mine_block().await,
            }
        }
    }

    async fn on_start(&mut self) {
        if !self.settings.mining || *self.status.read() == MinerState::Running {
            return;
        }
        info!("Miner starting");
        *self.status.write() = MinerState::Running;
        self.rebuild_candidate();
        self.schedule(MinerCommand::MineBlock, Duration::ZERO);
    }

    async fn on_block_arrived(&mut self, header: Header) {
        let status = *self.status.read();
        match status {
            MinerState::Running => {
                let parent_of_candidate = self
                    .candidate
                    .as_ref()
                    .and_then(|candidate| candidate.parent.as_ref().map(Header::id));
                if parent_of_candidate != Some(header.id()) {
                    debug!(block = %header.id(), "New tip, rebuilding candidate");
                    self.rebuild_candidate();
                }
            }
            MinerState::Idle => {
                if self.settings.mining && header.timestamp >= self.started_at {
                    self.schedule(MinerCommand::StartMining, Duration::ZERO);
                }
            }
        }
    }

    async fn on_mine_block(&mut self) {
        if *self.status.read() != MinerState::Running {
            return;
        }
        self.nonce = self.nonce.wrapping_add(1);

        let Some(candidate) = self.candidate.clone() else {
            self.rebuild_candidate();
            self.schedule(MinerCommand::MineBlock, NO_CANDIDATE_RETRY);
            return;
        };

        match self.verify_candidate(&candidate, self.nonce) {
            Some(block) => {
                info!(
                    block = %block.id(),
                    height = block.height(),
                    txs = block.payload.transactions.len(),
                    "Mined block"
                );
                let proofs = block.ad_proofs.clone();
                let _ = self
                    .outbound
                    .send(LocallyGeneratedModifier::Header(Box::new(
                        block.header.clone(),
                    )))
                    .await;
                let _ = self
                    .outbound
                    .send(LocallyGeneratedModifier::Payload(block.payload.clone()))
                    .await;
                if let Some(proofs) = proofs {
                    let _ = self
                        .outbound
                        .send(LocallyGeneratedModifier::AdProofs(proofs))
                        .await;
                }
                self.schedule(MinerCommand::MineBlock, self.settings.mining_delay());
            }
            None => self.schedule(MinerCommand::MineBlock, Duration::ZERO),
        }
    }

    /// Check one nonce against the candidate. Returns the signed block
    /// when the work hash meets the difficulty.
    fn verify_candidate(&self, candidate: &CandidateBlock, nonce: u64) -> Option<Block> {
        let payload = Payload::new(candidate.transactions.clone());
        let proofs = AdProofs::new(candidate.ad_proof.clone());
        let mut header = Header {
            parent_id: candidate
                .parent
                .as_ref()
                .map(Header::id)
                .unwrap_or(GENESIS_PARENT_ID),
            height: candidate
                .parent
                .as_ref()
                .map(|parent| parent.height + 1)
                .unwrap_or(GENESIS_HEIGHT),
            timestamp: candidate.timestamp,
            difficulty: candidate.difficulty,
            state_root: candidate.ad_digest,
            ad_proofs_root: proofs.digest(),
            payload_id: payload.id(),
            ad_proofs_id: proofs.id(),
            nonce,
            miner_pk: [0u8; 32],
            signature: vec![],
        };
        header.sign(&self.key);

        if !validate_pow(&header.id(), candidate.difficulty) {
            return None;
        }
        Some(Block::new(header, payload, Some(proofs)))
    }

    fn rebuild_candidate(&mut self) {
        match self.build_candidate() {
            Ok(candidate) => {
                debug!(
                    txs = candidate.transactions.len(),
                    difficulty = candidate.difficulty,
                    "Built candidate"
                );
                self.candidate = Some(candidate);
                self.nonce = 0;
            }
            Err(e) => {
                warn!(error = %e, "Candidate assembly failed");
                self.candidate = None;
            }
        }
    }

    /// Assemble a candidate: snapshot the collaborators, admit mempool
    /// transactions greedily under the size cap, append the coinbase
    /// spending their open fee boxes, sort by timestamp with the
    /// coinbase last, and derive proofs and difficulty.
    fn build_candidate(&self) -> ChainResult<CandidateBlock> {
        let state = self.state_view.read().clone();
        let parent = self.chain.best_header()?;
        if parent.is_none() && !self.settings.offline_generation {
            return Err(ChainError::NoTipToMineOn);
        }
        let height = parent
            .as_ref()
            .map(|header| header.height + 1)
            .unwrap_or(GENESIS_HEIGHT);

        let mut chosen = Vec::new();
        let mut total = 0usize;
        for tx in state.filter_valid(self.mempool.take_all()) {
            let length = tx.serialized_length();
            if total + length > self.settings.block_max_size {
                break;
            }
            total += length;
            chosen.push(tx);
        }
        chosen.sort_by_key(|tx| tx.timestamp);

        let timestamp = self.clock.now_millis();
        chosen.push(self.coinbase_for(&chosen, height, timestamp));

        let (ad_proof, ad_digest) = state
            .proofs_for_transactions(&chosen)
            .map_err(|e| ChainError::Serialization(e.to_string()))?;

        let difficulty = match &parent {
            Some(parent) => self.chain.required_difficulty_after(parent)?,
            None => self.chain.initial_difficulty(),
        };

        Ok(CandidateBlock {
            parent,
            ad_proof,
            ad_digest,
            transactions: chosen,
            timestamp,
            difficulty,
        })
    }

    /// Coinbase transaction: spends the open fee boxes the admitted
    /// transactions created and awards the emission plus fees to the
    /// miner key.
    fn coinbase_for(
        &self,
        admitted: &[Transaction],
        height: Height,
        timestamp: u64,
    ) -> Transaction {
        let mut fees = 0u64;
        let unlockers: Vec<Unlocker> = admitted
            .iter()
            .flat_map(|tx| tx.outputs.iter())
            .filter_map(|output| match output {
                StateBox::Open(open) => {
                    fees = fees.saturating_add(open.amount);
                    Some(Unlocker {
                        box_id: output.id(),
                        proof: None,
                    })
                }
                _ => None,
            })
            .collect();

        let amount = self.emission.supply_at(height).saturating_add(fees);
        let mut coinbase = Transaction {
            unlockers,
            outputs: vec![StateBox::Coinbase(CoinbaseBox {
                proposition: self.key.verifying_key().to_bytes(),
                nonce: height,
                amount,
            })],
            timestamp,
            sender: self.key.verifying_key().to_bytes(),
            signature: vec![],
        };
        coinbase.sign(&self.key);
        coinbase
    }

    /// Schedule a command for later delivery without blocking the loop
    fn schedule(&self, command: MinerCommand, delay: Duration) {
        let sender = self.commands_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = sender.send(command).await;
        });
    }
}
