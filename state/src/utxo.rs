//! UTXO state
//!
//! Applies block transactions to the authenticated prover under the
//! consensus rules: every input must exist and unlock, debits must cover
//! non-coinbase credits, and the resulting digest must equal the header's
//! state root. Each committed version records the block it belongs to, so
//! the state can roll back by block identifier.
//!
//! The state value is externally immutable: every mutation returns a new
//! `UtxoState` sharing the prover behind a lock.

use std::sync::Arc;

use obelisk_consensus::{
    parse_box_bytes, AdProofs, Block, Header, StateDigest, Transaction, UnlockContext,
};
use obelisk_consensus::types::{Height, ModifierId};
use obelisk_storage::VersionedStore;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::prover::{Operation, PersistentProver};

/// Deepest rollback the state accepts, in committed versions
pub const MAX_ROLLBACK_DEPTH: usize = 10;

/// Key holding the block identifier of the current state version
fn best_version_key() -> [u8; 32] {
    obelisk_hash::hash(b"best_state_version")
}

/// Key holding the current state height
fn best_height_key() -> [u8; 32] {
    obelisk_hash::hash(b"state_height")
}

/// The authenticated UTXO state
pub struct UtxoState {
    version: ModifierId,
    height: Option<Height>,
    store: Arc<VersionedStore>,
    prover: Arc<Mutex<PersistentProver>>,
}

impl Clone for UtxoState {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            height: self.height,
            store: self.store.clone(),
            prover: self.prover.clone(),
        }
    }
}

impl UtxoState {
    /// Open the state over a store, restoring the persisted version and
    /// height when present.
    pub fn open(store: Arc<VersionedStore>) -> StateResult<Self> {
        let prover = PersistentProver::open(store.clone())?;
        let version = store
            .get(&best_version_key())?
            .and_then(|bytes| bytes.try_into().ok())
            .map(ModifierId::from_bytes)
            .unwrap_or_default();
        let height = store
            .get(&best_height_key())?
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_be_bytes);

        Ok(Self {
            version,
            height,
            store,
            prover: Arc::new(Mutex::new(prover)),
        })
    }

    /// Block identifier this state version belongs to
    pub fn version(&self) -> ModifierId {
        self.version
    }

    /// Height of the last applied block; `None` before genesis
    pub fn height(&self) -> Option<Height> {
        self.height
    }

    /// Current 33-byte state digest
    pub fn digest(&self) -> StateDigest {
        self.prover.lock().digest()
    }

    /// Height the next block will be validated at
    fn next_height(&self) -> Height {
        self.height.map(|h| h + 1).unwrap_or_default()
    }

    /// Raw stored bytes of a box, without a proof
    pub fn box_bytes(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.prover.lock().unauthenticated_lookup(key)
    }

    /// Validate a transaction against the current view at the next height
    pub fn validate(&self, tx: &Transaction) -> StateResult<()> {
        let prover = self.prover.lock();
        Self::validate_at(&prover, tx, self.next_height())
    }

    /// Keep only the transactions valid against the current view. Later
    /// transactions are not revalidated against earlier ones' spends; the
    /// block application is the arbiter of conflicts.
    pub fn filter_valid(&self, txs: Vec<Transaction>) -> Vec<Transaction> {
        let prover = self.prover.lock();
        let height = self.next_height();
        txs.into_iter()
            .filter(|tx| Self::validate_at(&prover, tx, height).is_ok())
            .collect()
    }

    fn validate_at(
        prover: &PersistentProver,
        tx: &Transaction,
        height: Height,
    ) -> StateResult<()> {
        tx.semantic_validity()?;

        let ctx = UnlockContext {
            transaction: tx,
            height,
        };
        let mut unlocked = 0usize;
        let mut debit: u64 = 0;
        for unlocker in &tx.unlockers {
            let stored = prover
                .unauthenticated_lookup(unlocker.box_id.as_bytes())
                .ok_or_else(|| StateError::BoxNotFound(unlocker.box_id.to_hex()))?;
            let (type_id, body) = stored
                .split_first()
                .ok_or_else(|| StateError::BoxNotFound(unlocker.box_id.to_hex()))?;
            let state_box = parse_box_bytes(body, *type_id)?;
            state_box.unlock_try(unlocker.proof.as_deref(), &ctx)?;
            unlocked += 1;
            debit = debit.saturating_add(state_box.amount());
        }
        if unlocked < tx.unlockers.len() {
            return Err(StateError::BoxNotFound("unlocker left locked".into()));
        }

        let credit: u64 = tx
            .outputs
            .iter()
            .filter(|bx| !matches!(bx, obelisk_consensus::StateBox::Coinbase(_)))
            .map(|bx| bx.amount())
            .fold(0, u64::saturating_add);
        if debit < credit {
            return Err(StateError::BalanceViolation { debit, credit });
        }
        Ok(())
    }

    /// Translate a transaction into prover operations: remove every
    /// referenced input, insert every created box.
    fn perform_transaction(prover: &mut PersistentProver, tx: &Transaction) -> StateResult<()> {
        for unlocker in &tx.unlockers {
            prover.perform_one_operation(&Operation::Remove(*unlocker.box_id.as_bytes()))?;
        }
        for output in tx.outputs.iter() {
            prover.perform_one_operation(&Operation::Insert(
                *output.id().as_bytes(),
                output.bytes(),
            ))?;
        }
        Ok(())
    }

    /// Apply a full block. On success returns the advanced state and the
    /// AD proofs produced for the transition; on any failure the prover
    /// is rolled back to the pre-block root before the error surfaces.
    pub fn apply_block(&self, block: &Block) -> StateResult<(UtxoState, AdProofs)> {
        let block_id = block.id();
        let height = block.height();
        let mut prover = self.prover.lock();
        let pre_digest = prover.digest();

        for tx in &block.payload.transactions {
            let applied = Self::validate_at(&prover, tx, height)
                .and_then(|()| Self::perform_transaction(&mut prover, tx));
            if let Err(e) = applied {
                warn!(block = %block_id, tx = %tx.id(), error = %e, "Transaction rejected, rolling back block");
                prover.rollback(&pre_digest)?;
                return Err(e);
            }
        }

        let digest = prover.digest();
        if digest != block.header.state_root {
            warn!(block = %block_id, "State root mismatch, rolling back block");
            prover.rollback(&pre_digest)?;
            return Err(StateError::RootMismatch {
                modifier: block_id.to_hex(),
                expected: block.header.state_root.to_hex(),
                actual: digest.to_hex(),
            });
        }

        let metadata = vec![
            (block_id.as_bytes().to_vec(), digest.to_bytes().to_vec()),
            (
                obelisk_hash::hash(&digest.to_bytes()).to_vec(),
                block_id.as_bytes().to_vec(),
            ),
            (
                best_version_key().to_vec(),
                block_id.as_bytes().to_vec(),
            ),
            (best_height_key().to_vec(), height.to_be_bytes().to_vec()),
        ];
        let proof_bytes = prover.generate_proof_and_update_storage(metadata)?;
        let proofs = AdProofs::new(proof_bytes);
        if proofs.digest() != block.header.ad_proofs_root {
            warn!(block = %block_id, "AD proof mismatch, rolling back block");
            prover.rollback(&pre_digest)?;
            return Err(StateError::AdProofMismatch(block_id.to_hex()));
        }
        drop(prover);

        info!(block = %block_id, height, txs = block.payload.transactions.len(), "Applied block to state");
        Ok((
            Self {
                version: block_id,
                height: Some(height),
                store: self.store.clone(),
                prover: self.prover.clone(),
            },
            proofs,
        ))
    }

    /// Advance the state version to a header without touching the tree —
    /// the digest-only regime, where transactions are validated through
    /// supplied AD proofs instead of being replayed.
    pub fn apply_header(&self, header: &Header) -> UtxoState {
        Self {
            version: header.id(),
            height: Some(header.height),
            store: self.store.clone(),
            prover: self.prover.clone(),
        }
    }

    /// Apply the transactions speculatively, returning the serialized
    /// proof and the digest they would produce, then restore the
    /// pre-call root. The digest is unchanged whether or not the
    /// transactions are valid.
    pub fn proofs_for_transactions(
        &self,
        txs: &[Transaction],
    ) -> StateResult<(Vec<u8>, StateDigest)> {
        let mut prover = self.prover.lock();
        let height = self.next_height();

        for tx in txs {
            let applied = Self::validate_at(&prover, tx, height)
                .and_then(|()| Self::perform_transaction(&mut prover, tx));
            if let Err(e) = applied {
                prover.discard_batch();
                return Err(e);
            }
        }
        Ok(prover.generate_proof_and_discard())
    }

    /// Roll the state back to a previously applied block
    pub fn rollback_to(&self, version: ModifierId) -> StateResult<UtxoState> {
        let digest_bytes = self
            .store
            .get(version.as_bytes())?
            .ok_or_else(|| StateError::UnknownRollbackVersion(version.to_hex()))?;
        let digest = StateDigest::from_bytes(&digest_bytes)
            .ok_or_else(|| StateError::UnknownRollbackVersion(version.to_hex()))?;

        let reachable = self.store.rollback_versions()?;
        let depth = reachable
            .iter()
            .position(|tag| *tag == digest.to_bytes())
            .ok_or_else(|| StateError::UnknownRollbackVersion(version.to_hex()))?;
        if depth > MAX_ROLLBACK_DEPTH {
            return Err(StateError::RollbackTooDeep {
                depth,
                max: MAX_ROLLBACK_DEPTH,
            });
        }

        let mut prover = self.prover.lock();
        prover.rollback(&digest)?;
        drop(prover);

        let height = self
            .store
            .get(&best_height_key())?
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_be_bytes);

        debug!(version = %version, ?height, "Rolled back state");
        Ok(Self {
            version,
            height,
            store: self.store.clone(),
            prover: self.prover.clone(),
        })
    }

    /// Trim the version history of the backing store
    pub fn clean(&self, keep_versions: usize) -> StateResult<usize> {
        Ok(self.store.clean(keep_versions)?)
    }

    /// Block identifiers reachable via rollback, newest first,
    /// cross-looked-up through the digest index.
    pub fn rollback_versions(&self) -> StateResult<Vec<ModifierId>> {
        let mut out = Vec::new();
        for tag in self.store.rollback_versions()? {
            if let Some(bytes) = self.store.get(&obelisk_hash::hash(&tag))? {
                if let Ok(id) = bytes.try_into() {
                    out.push(ModifierId::from_bytes(id));
                }
            }
        }
        Ok(out)
    }
}
