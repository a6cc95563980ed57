//! Persistent batch prover
//!
//! Wraps the authenticated tree and the versioned store. Operations
//! accumulate into a batch; generating a proof serializes the pruned
//! pre-batch tree along every touched path together with the operation
//! list, and committing additionally persists the new tree nodes
//! (content-addressed by label) plus caller metadata under a storage
//! version tagged by the new digest. Rolling back restores both the
//! store and the in-memory root for any digest still inside the
//! retention window.

use std::sync::Arc;

use obelisk_consensus::StateDigest;
use obelisk_storage::{StorageError, VersionedStore};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tree::{self, Key, Node};

/// Key the last committed digest is stored under
fn root_key() -> [u8; 32] {
    obelisk_hash::hash(b"obelisk.avl.root")
}

/// One authenticated tree operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert a new key with a value
    Insert(Key, Vec<u8>),
    /// Remove an existing key
    Remove(Key),
    /// Prove (non-)membership of a key
    Lookup(Key),
}

impl Operation {
    fn key(&self) -> &Key {
        match self {
            Operation::Insert(key, _) | Operation::Remove(key) | Operation::Lookup(key) => key,
        }
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        match self {
            Operation::Insert(key, value) => {
                out.push(1);
                out.extend_from_slice(key);
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value);
            }
            Operation::Remove(key) => {
                out.push(2);
                out.extend_from_slice(key);
            }
            Operation::Lookup(key) => {
                out.push(3);
                out.extend_from_slice(key);
            }
        }
    }
}

/// Separator between the pruned tree and the operation list in a proof
const PROOF_OPS_MARKER: u8 = 0xFF;

/// Batch AVL+ prover persisted through the versioned store
pub struct PersistentProver {
    store: Arc<VersionedStore>,
    /// Working root, including uncommitted batch operations
    root: Option<Arc<Node>>,
    /// Root as of the last proof boundary
    committed_root: Option<Arc<Node>>,
    batch: Vec<Operation>,
}

impl PersistentProver {
    /// Open a prover over the store, restoring the last committed root
    pub fn open(store: Arc<VersionedStore>) -> StateResult<Self> {
        let root = match store.get(&root_key())? {
            Some(bytes) => {
                let digest = StateDigest::from_bytes(&bytes).ok_or_else(|| {
                    StateError::CorruptedNode("stored root digest malformed".into())
                })?;
                if digest == tree::empty_digest() {
                    None
                } else {
                    Some(Self::load_root(&store, &digest)?)
                }
            }
            None => None,
        };
        Ok(Self {
            store,
            committed_root: root.clone(),
            root,
            batch: Vec::new(),
        })
    }

    fn load_root(store: &VersionedStore, digest: &StateDigest) -> StateResult<Arc<Node>> {
        let fetch = |label: &[u8; 32]| -> StateResult<Vec<u8>> {
            store
                .get(label)?
                .ok_or_else(|| StateError::CorruptedNode(hex::encode(label)))
        };
        tree::load(&digest.root, &fetch)
    }

    /// Current digest, including uncommitted operations
    pub fn digest(&self) -> StateDigest {
        tree::digest(&self.root)
    }

    /// Raw value of a key, without a proof
    pub fn unauthenticated_lookup(&self, key: &Key) -> Option<Vec<u8>> {
        tree::lookup(&self.root, key)
    }

    /// Apply one operation to the working tree. Failures leave the tree
    /// untouched, but earlier operations of the batch remain applied: the
    /// caller must roll back to the previous root before reusing the
    /// prover.
    pub fn perform_one_operation(&mut self, op: &Operation) -> StateResult<Option<Vec<u8>>> {
        let result = match op {
            Operation::Insert(key, value) => {
                self.root = Some(tree::insert(&self.root, *key, value.clone())?);
                None
            }
            Operation::Remove(key) => {
                let prior = tree::lookup(&self.root, key);
                self.root = tree::remove(&self.root, key)?;
                prior
            }
            Operation::Lookup(key) => tree::lookup(&self.root, key),
        };
        self.batch.push(op.clone());
        Ok(result)
    }

    /// Serialize the proof for the operations performed since the last
    /// boundary: the pruned pre-batch tree, a marker, and the operations.
    fn serialize_batch_proof(&self) -> Vec<u8> {
        let mut touched: Vec<Key> = self.batch.iter().map(|op| *op.key()).collect();
        touched.sort_unstable();
        touched.dedup();

        let mut out = Vec::new();
        tree::serialize_pruned(&self.committed_root, &touched, &mut out);
        out.push(PROOF_OPS_MARKER);
        out.extend_from_slice(&(self.batch.len() as u32).to_be_bytes());
        for op in &self.batch {
            op.serialize_into(&mut out);
        }
        out
    }

    /// Serialize the batch proof, commit the new tree nodes and the
    /// caller metadata under a version tagged by the new digest, and
    /// start a fresh batch.
    pub fn generate_proof_and_update_storage(
        &mut self,
        metadata: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> StateResult<Vec<u8>> {
        let proof = self.serialize_batch_proof();
        let version = self.digest().to_bytes().to_vec();

        let mut inserts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut stack: Vec<Arc<Node>> = self.root.iter().cloned().collect();
        while let Some(node) = stack.pop() {
            if self.store.get(node.label())?.is_some() {
                continue;
            }
            inserts.push((node.label().to_vec(), node.to_bytes()));
            if let Node::Internal { left, right, .. } = &*node {
                stack.push(left.clone());
                stack.push(right.clone());
            }
        }
        let new_nodes = inserts.len();
        inserts.push((root_key().to_vec(), version.clone()));
        inserts.extend(metadata);

        self.store.bulk_insert(&version, &inserts, &[])?;
        self.committed_root = self.root.clone();
        self.batch.clear();

        debug!(
            digest = %self.digest(),
            new_nodes,
            proof_len = proof.len(),
            "Committed prover version"
        );
        Ok(proof)
    }

    /// Serialize the batch proof and the resulting digest, then drop the
    /// batch, restoring the pre-batch root. Nothing is persisted.
    pub fn generate_proof_and_discard(&mut self) -> (Vec<u8>, StateDigest) {
        let proof = self.serialize_batch_proof();
        let resulting = self.digest();
        self.root = self.committed_root.clone();
        self.batch.clear();
        (proof, resulting)
    }

    /// Drop uncommitted operations, restoring the pre-batch root
    pub fn discard_batch(&mut self) {
        self.root = self.committed_root.clone();
        self.batch.clear();
    }

    /// Restore the prover to a previously committed digest. Uncommitted
    /// operations are discarded; committed versions newer than the target
    /// are undone in the store.
    pub fn rollback(&mut self, digest: &StateDigest) -> StateResult<()> {
        if *digest == tree::digest(&self.committed_root) {
            self.discard_batch();
            return Ok(());
        }

        let version = digest.to_bytes().to_vec();
        self.store.rollback(&version).map_err(|e| match e {
            StorageError::UnknownVersion(v) => StateError::UnknownRollbackVersion(v),
            other => StateError::Storage(other),
        })?;

        self.root = if *digest == tree::empty_digest() {
            None
        } else {
            Some(Self::load_root(&self.store, digest)?)
        };
        self.committed_root = self.root.clone();
        self.batch.clear();

        debug!(digest = %digest, "Rolled back prover");
        Ok(())
    }

    /// The versioned store backing this prover
    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }
}
