//! Header chain processor
//!
//! Accepts headers, scores them by cumulative difficulty, keeps the
//! best-chain indices in the versioned store and answers difficulty
//! queries for the miner. Every index mutation for one header commits
//! through a single `bulk_insert`, so observers see either the pre-state
//! or the full post-state.
//!
//! # Persisted keys
//!
//! | key | value |
//! |-----|-------|
//! | `[header type id] × 32` | best header ID |
//! | `0xFF × 32` | best full-block ID |
//! | `hash("score" ‖ id)` | cumulative score, big-endian |
//! | `hash("height" ‖ id)` | height, big-endian |
//! | `hash("validity" ‖ id)` | `0x01` unknown / `0x02` valid / `0x03` invalid |
//! | `hash(int32(height))` | concatenated header IDs, best chain first |
//! | `id` | serialized header |

use std::collections::HashSet;
use std::sync::Arc;

use obelisk_consensus::{
    validate_pow, Header, LinearDifficultyController, ModifierId, ModifierType, NetworkTime,
    GENESIS_HEIGHT,
};
use obelisk_consensus::types::{Difficulty, Height};
use obelisk_storage::VersionedStore;
use tracing::{debug, info, warn};

use crate::error::{ChainError, ChainResult};
use crate::settings::{ChainSettings, CoreSettings, StateMode};

/// Best-header pointer key: the header modifier type byte, repeated
fn best_header_key() -> [u8; 32] {
    [ModifierType::Header.type_id(); 32]
}

/// Best full-block pointer key
fn best_block_key() -> [u8; 32] {
    [0xFF; 32]
}

fn score_key(id: &ModifierId) -> [u8; 32] {
    obelisk_hash::hash_many(&[b"score", id.as_bytes()])
}

fn height_key(id: &ModifierId) -> [u8; 32] {
    obelisk_hash::hash_many(&[b"height", id.as_bytes()])
}

fn validity_key(id: &ModifierId) -> [u8; 32] {
    obelisk_hash::hash_many(&[b"validity", id.as_bytes()])
}

fn height_ids_key(height: Height) -> [u8; 32] {
    obelisk_hash::hash(&(height as u32).to_be_bytes())
}

/// Recorded verdict for a modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Unknown,
    Valid,
    Invalid,
}

impl Validity {
    fn to_byte(self) -> u8 {
        match self {
            Validity::Unknown => 0x01,
            Validity::Valid => 0x02,
            Validity::Invalid => 0x03,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0x02 => Validity::Valid,
            0x03 => Validity::Invalid,
            _ => Validity::Unknown,
        }
    }
}

/// Per-ingestion verdict of the header processor: what to roll back,
/// what to apply, the new best header if it changed, and the modifiers
/// to download next.
#[derive(Debug, Clone, Default)]
pub struct ProgressInfo {
    /// Branch point to roll the state back to before applying
    pub rollback_to: Option<ModifierId>,
    /// Headers whose blocks should be applied, oldest first
    pub to_apply: Vec<Header>,
    /// The newly best header, when the best chain changed
    pub best_header: Option<Header>,
    /// Modifiers the node should fetch next
    pub to_download: Vec<(ModifierType, ModifierId)>,
}

/// The header chain processor
pub struct HeaderProcessor {
    store: Arc<VersionedStore>,
    chain: ChainSettings,
    core: CoreSettings,
    controller: LinearDifficultyController,
    clock: Arc<dyn NetworkTime>,
}

impl HeaderProcessor {
    /// Create a processor over its store
    pub fn new(
        store: Arc<VersionedStore>,
        chain: ChainSettings,
        core: CoreSettings,
        clock: Arc<dyn NetworkTime>,
    ) -> Self {
        let controller = chain.difficulty_controller();
        Self {
            store,
            chain,
            core,
            controller,
            clock,
        }
    }

    // --- Readers ---

    /// Stored header by identifier
    pub fn header_by_id(&self, id: &ModifierId) -> ChainResult<Option<Header>> {
        match self.store.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether a header is known
    pub fn contains(&self, id: &ModifierId) -> ChainResult<bool> {
        Ok(self.store.get(id.as_bytes())?.is_some())
    }

    /// Cumulative score of a header
    pub fn score_of(&self, id: &ModifierId) -> ChainResult<Option<Difficulty>> {
        Ok(self
            .store
            .get(&score_key(id))?
            .and_then(|bytes| bytes.try_into().ok())
            .map(u128::from_be_bytes))
    }

    /// Height of a header
    pub fn height_of(&self, id: &ModifierId) -> ChainResult<Option<Height>> {
        Ok(self
            .store
            .get(&height_key(id))?
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_be_bytes))
    }

    /// Recorded validity verdict
    pub fn validity_of(&self, id: &ModifierId) -> ChainResult<Validity> {
        Ok(self
            .store
            .get(&validity_key(id))?
            .and_then(|bytes| bytes.first().copied())
            .map(Validity::from_byte)
            .unwrap_or(Validity::Unknown))
    }

    /// Every known header identifier at a height, best chain first
    pub fn header_ids_at_height(&self, height: Height) -> ChainResult<Vec<ModifierId>> {
        let bytes = self.store.get(&height_ids_key(height))?.unwrap_or_default();
        Ok(bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut id = [0u8; 32];
                id.copy_from_slice(chunk);
                ModifierId::from_bytes(id)
            })
            .collect())
    }

    /// Identifier of the best header
    pub fn best_header_id(&self) -> ChainResult<Option<ModifierId>> {
        Ok(self
            .store
            .get(&best_header_key())?
            .and_then(|bytes| bytes.try_into().ok())
            .map(ModifierId::from_bytes))
    }

    /// The best header
    pub fn best_header(&self) -> ChainResult<Option<Header>> {
        match self.best_header_id()? {
            Some(id) => self.header_by_id(&id),
            None => Ok(None),
        }
    }

    /// Height of the best header
    pub fn best_height(&self) -> ChainResult<Option<Height>> {
        Ok(self.best_header()?.map(|header| header.height))
    }

    /// Identifier of the best fully-applied block
    pub fn best_block_id(&self) -> ChainResult<Option<ModifierId>> {
        Ok(self
            .store
            .get(&best_block_key())?
            .and_then(|bytes| bytes.try_into().ok())
            .map(ModifierId::from_bytes))
    }

    /// Whether a header lies on the best chain
    pub fn is_on_best_chain(&self, id: &ModifierId) -> ChainResult<bool> {
        match self.height_of(id)? {
            Some(height) => Ok(self.header_ids_at_height(height)?.first() == Some(id)),
            None => Ok(false),
        }
    }

    // --- Section records (payloads, AD proofs) ---

    /// Persist the raw bytes of a block section under its modifier ID
    pub fn put_section_bytes(&self, id: &ModifierId, bytes: Vec<u8>) -> ChainResult<()> {
        let version = obelisk_hash::hash_many(&[b"section", id.as_bytes()]);
        self.store
            .bulk_insert(&version, &[(id.as_bytes().to_vec(), bytes)], &[])?;
        Ok(())
    }

    /// Raw bytes of a stored block section
    pub fn section_bytes(&self, id: &ModifierId) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.store.get(id.as_bytes())?)
    }

    // --- Validation ---

    /// Validate an incoming header against the chain. Errors never mutate
    /// persistent state.
    pub fn validate(&self, header: &Header) -> ChainResult<()> {
        let id = header.id();
        let now = self.clock.now_millis();

        if header.is_genesis() {
            if self.best_header_id()?.is_some() {
                return Err(ChainError::InvalidGenesis {
                    id: id.to_hex(),
                    reason: "a best header already exists".into(),
                });
            }
            if header.height != GENESIS_HEIGHT {
                return Err(ChainError::InvalidGenesis {
                    id: id.to_hex(),
                    reason: format!("genesis height must be {GENESIS_HEIGHT}, got {}", header.height),
                });
            }
        } else {
            let parent = self
                .header_by_id(&header.parent_id)?
                .ok_or_else(|| ChainError::ParentMissing {
                    id: id.to_hex(),
                    parent: header.parent_id.to_hex(),
                })?;

            if header.height != parent.height + 1 {
                return Err(ChainError::WrongHeight {
                    id: id.to_hex(),
                    got: header.height,
                    expected: parent.height + 1,
                });
            }
            if header.timestamp < parent.timestamp {
                return Err(ChainError::TimestampBeforeParent { id: id.to_hex() });
            }
            let required = self.required_difficulty_after(&parent)?;
            if header.difficulty < required {
                return Err(ChainError::InsufficientDifficulty {
                    id: id.to_hex(),
                    got: header.difficulty,
                    required,
                });
            }
            if let Some(best_height) = self.best_height()? {
                let depth = best_height.saturating_sub(parent.height);
                if depth >= self.chain.max_rollback_depth {
                    return Err(ChainError::ForkTooDeep {
                        id: id.to_hex(),
                        depth,
                    });
                }
            }
        }

        let drift = header.timestamp.saturating_sub(now);
        if drift > self.chain.max_time_drift_ms {
            return Err(ChainError::TimestampDrift {
                id: id.to_hex(),
                timestamp: header.timestamp,
                drift,
            });
        }
        if !validate_pow(&id, header.difficulty) {
            return Err(ChainError::PowInvalid { id: id.to_hex() });
        }
        if !header.verify_signature() {
            return Err(ChainError::BadSignature { id: id.to_hex() });
        }
        Ok(())
    }

    // --- Processing ---

    /// Ingest a validated header: persist score, height and the height
    /// index, switch the best chain when the score strictly exceeds the
    /// current best, and describe what to fetch and apply next.
    pub fn process(&self, header: &Header) -> ChainResult<ProgressInfo> {
        let id = header.id();
        if self.contains(&id)? {
            return Err(ChainError::AlreadyKnown(id.to_hex()));
        }

        let parent_score = if header.is_genesis() {
            0
        } else {
            self.score_of(&header.parent_id)?
                .ok_or_else(|| ChainError::ParentMissing {
                    id: id.to_hex(),
                    parent: header.parent_id.to_hex(),
                })?
        };
        let score = parent_score.saturating_add(header.difficulty);

        let best_score = match self.best_header_id()? {
            Some(best_id) => Some(self.score_of(&best_id)?.unwrap_or_default()),
            None => None,
        };
        let becomes_best = best_score.map_or(true, |best| score > best);

        let mut to_insert: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (id.as_bytes().to_vec(), bincode::serialize(header)?),
            (score_key(&id).to_vec(), score.to_be_bytes().to_vec()),
            (
                height_key(&id).to_vec(),
                header.height.to_be_bytes().to_vec(),
            ),
            (
                validity_key(&id).to_vec(),
                vec![Validity::Unknown.to_byte()],
            ),
        ];

        let mut progress = ProgressInfo {
            to_download: self.downloads_for(header),
            ..ProgressInfo::default()
        };

        if becomes_best {
            to_insert.push((best_header_key().to_vec(), id.as_bytes().to_vec()));

            // This header leads its own height.
            let mut own_row = vec![id];
            own_row.extend(self.header_ids_at_height(header.height)?);
            to_insert.push((
                height_ids_key(header.height).to_vec(),
                encode_id_row(&own_row),
            ));

            // Walk the fork back to the nearest ancestor already on the
            // best chain, promoting each fork header to the front of its
            // height row.
            let mut fork_chain: Vec<Header> = Vec::new();
            let mut branch_point = None;
            let mut cursor = if header.is_genesis() {
                None
            } else {
                self.header_by_id(&header.parent_id)?
            };
            while let Some(ancestor) = cursor {
                let ancestor_id = ancestor.id();
                let row = self.header_ids_at_height(ancestor.height)?;
                if row.first() == Some(&ancestor_id) {
                    branch_point = Some(ancestor_id);
                    break;
                }
                let mut promoted = vec![ancestor_id];
                promoted.extend(row.into_iter().filter(|entry| *entry != ancestor_id));
                to_insert.push((
                    height_ids_key(ancestor.height).to_vec(),
                    encode_id_row(&promoted),
                ));
                cursor = if ancestor.is_genesis() {
                    None
                } else {
                    self.header_by_id(&ancestor.parent_id)?
                };
                fork_chain.push(ancestor);
            }

            fork_chain.reverse();
            if !fork_chain.is_empty() {
                info!(
                    new_best = %id,
                    depth = fork_chain.len(),
                    "Reorganizing best header chain"
                );
                progress.rollback_to = branch_point;
            }
            fork_chain.push(header.clone());
            progress.to_apply = fork_chain;
            progress.best_header = Some(header.clone());
        } else {
            // Off-chain header: appended to the tail of its height row.
            let mut row = self.header_ids_at_height(header.height)?;
            row.push(id);
            to_insert.push((height_ids_key(header.height).to_vec(), encode_id_row(&row)));
            debug!(header = %id, height = header.height, "Stored non-best header");
        }

        self.store.bulk_insert(id.as_bytes(), &to_insert, &[])?;

        info!(
            header = %id,
            height = header.height,
            score,
            best = becomes_best,
            "Processed header"
        );
        Ok(progress)
    }

    fn downloads_for(&self, header: &Header) -> Vec<(ModifierType, ModifierId)> {
        let mut downloads = vec![(ModifierType::Payload, header.payload_id)];
        if self.core.verify_transactions && self.core.state_mode == StateMode::Digest {
            downloads.push((ModifierType::AdProofs, header.ad_proofs_id));
        }
        downloads
    }

    /// Record a block as fully applied
    pub fn update_best_block(&self, id: &ModifierId) -> ChainResult<()> {
        let version = obelisk_hash::hash_many(&[b"best_block", id.as_bytes()]);
        self.store.bulk_insert(
            &version,
            &[(best_block_key().to_vec(), id.as_bytes().to_vec())],
            &[],
        )?;
        Ok(())
    }

    /// Mark a modifier semantically valid
    pub fn mark_valid(&self, id: &ModifierId) -> ChainResult<()> {
        let version = obelisk_hash::hash_many(&[b"valid", id.as_bytes()]);
        self.store.bulk_insert(
            &version,
            &[(validity_key(id).to_vec(), vec![Validity::Valid.to_byte()])],
            &[],
        )?;
        Ok(())
    }

    /// Drop an invalid header: its score and record go away, any stored
    /// payload or AD-proof sections go with it, and best pointers that
    /// named it fall back to its parent. Returns the removed keys and the
    /// updated key-values. The height rows are left as they are; a later
    /// strictly-better header reorders them.
    pub fn report_invalid(
        &self,
        header: &Header,
    ) -> ChainResult<(Vec<Vec<u8>>, Vec<(Vec<u8>, Vec<u8>)>)> {
        let id = header.id();
        let mut to_remove: Vec<Vec<u8>> = vec![
            score_key(&id).to_vec(),
            id.as_bytes().to_vec(),
        ];
        if self.section_bytes(&header.payload_id)?.is_some() {
            to_remove.push(header.payload_id.as_bytes().to_vec());
        }
        if self.section_bytes(&header.ad_proofs_id)?.is_some() {
            to_remove.push(header.ad_proofs_id.as_bytes().to_vec());
        }

        let mut to_update: Vec<(Vec<u8>, Vec<u8>)> = vec![(
            validity_key(&id).to_vec(),
            vec![Validity::Invalid.to_byte()],
        )];
        if self.best_header_id()? == Some(id) {
            to_update.push((
                best_header_key().to_vec(),
                header.parent_id.as_bytes().to_vec(),
            ));
        }
        if self.best_block_id()? == Some(id) {
            to_update.push((
                best_block_key().to_vec(),
                header.parent_id.as_bytes().to_vec(),
            ));
        }

        let version = obelisk_hash::hash_many(&[b"invalid", id.as_bytes()]);
        self.store.bulk_insert(&version, &to_update, &to_remove)?;
        warn!(header = %id, "Dropped invalid header");
        Ok((to_remove, to_update))
    }

    // --- Difficulty ---

    /// The configured initial difficulty
    pub fn initial_difficulty(&self) -> Difficulty {
        self.chain.initial_difficulty
    }

    /// Difficulty required of a child of `parent`
    pub fn required_difficulty_after(&self, parent: &Header) -> ChainResult<Difficulty> {
        if parent.height <= 2 {
            return Ok(self.chain.initial_difficulty);
        }
        let heights = self.controller.heights_for_retargeting_at(parent.height);
        let oldest = heights.first().copied().unwrap_or(parent.height);
        let limit = (parent.height - oldest + 1) as usize;
        let chain = self.header_chain_back(limit, parent.clone(), |header| header.height <= oldest)?;

        let wanted: HashSet<Height> = heights.into_iter().collect();
        let samples: Vec<(Height, Header)> = chain
            .into_iter()
            .filter(|header| wanted.contains(&header.height))
            .map(|header| (header.height, header))
            .collect();
        Ok(self.controller.get_difficulty(&samples))
    }

    /// Walk parent links from `start`, accumulating up to `limit` headers
    /// and stopping (inclusively) at the first header satisfying `until`.
    /// A missing parent ends the walk with the accumulated prefix.
    /// Returns oldest first.
    pub fn header_chain_back<F>(
        &self,
        limit: usize,
        start: Header,
        until: F,
    ) -> ChainResult<Vec<Header>>
    where
        F: Fn(&Header) -> bool,
    {
        let mut acc = Vec::new();
        let mut cursor = Some(start);
        while let Some(header) = cursor {
            let stop = until(&header) || header.is_genesis();
            let parent_id = header.parent_id;
            acc.push(header);
            if stop || acc.len() >= limit {
                break;
            }
            cursor = self.header_by_id(&parent_id)?;
        }
        acc.reverse();
        Ok(acc)
    }

    /// Trim the version history of the backing store
    pub fn clean(&self) -> ChainResult<usize> {
        Ok(self.store.clean(self.core.keep_versions)?)
    }
}

fn encode_id_row(ids: &[ModifierId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 32);
    for id in ids {
        out.extend_from_slice(id.as_bytes());
    }
    out
}
