//! Transactions
//!
//! A transaction names the boxes it spends through unlockers, creates a
//! set of new boxes, and is signed by its sender. Semantic validity is
//! everything that can be checked without state; contextual validity
//! (referenced boxes exist, unlock, and balance) lives in the UTXO state.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::boxes::StateBox;
use crate::error::{ConsensusError, ConsensusResult};
use crate::types::{BoxId, TxId};

/// Reference to a box being spent, with an optional dedicated proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unlocker {
    /// Identifier of the box being spent
    pub box_id: BoxId,
    /// Proof unlocking the box; when absent the transaction-level
    /// signature stands in for boxes locked to the sender key
    pub proof: Option<Vec<u8>>,
}

/// A transaction spending and creating boxes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Boxes spent
    pub unlockers: Vec<Unlocker>,
    /// Boxes created
    pub outputs: Vec<StateBox>,
    /// Timestamp in milliseconds since the epoch
    pub timestamp: u64,
    /// Sender public key
    pub sender: [u8; 32],
    /// Sender signature over the message bytes
    pub signature: Vec<u8>,
}

impl Transaction {
    /// The bytes signatures and proofs commit to: spent box IDs, created
    /// boxes, timestamp and sender — everything except the proofs and the
    /// signature themselves.
    pub fn message_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for unlocker in &self.unlockers {
            out.extend_from_slice(unlocker.box_id.as_bytes());
        }
        for output in &self.outputs {
            out.extend_from_slice(&output.bytes());
        }
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.sender);
        out
    }

    /// Transaction identifier: hash of the message bytes, so the identity
    /// is stable across signing.
    pub fn id(&self) -> TxId {
        TxId::from_bytes(obelisk_hash::hash(&self.message_bytes()))
    }

    /// Whether this is a coinbase transaction (creates an emission box)
    pub fn is_coinbase(&self) -> bool {
        self.outputs
            .iter()
            .any(|bx| matches!(bx, StateBox::Coinbase(_)))
    }

    /// Serialized length, used for the block size cap
    pub fn serialized_length(&self) -> usize {
        let proofs: usize = self
            .unlockers
            .iter()
            .map(|u| u.proof.as_ref().map_or(0, |p| p.len()))
            .sum();
        self.message_bytes().len() + proofs + self.signature.len()
    }

    /// Sign the transaction with the sender key, filling `sender` and
    /// `signature`.
    pub fn sign(&mut self, key: &SigningKey) {
        self.sender = key.verifying_key().to_bytes();
        let sig = key.sign(&self.message_bytes());
        self.signature = sig.to_bytes().to_vec();
    }

    /// Check everything that does not require state: structure, duplicate
    /// inputs, timestamp, and the sender signature.
    pub fn semantic_validity(&self) -> ConsensusResult<()> {
        if self.outputs.is_empty() {
            return Err(ConsensusError::EmptyOutputs);
        }
        if self.unlockers.is_empty() && !self.is_coinbase() {
            return Err(ConsensusError::EmptyUnlockers);
        }
        if self.timestamp == 0 {
            return Err(ConsensusError::ZeroTimestamp);
        }
        let mut seen = HashSet::with_capacity(self.unlockers.len());
        for unlocker in &self.unlockers {
            if !seen.insert(unlocker.box_id) {
                return Err(ConsensusError::DuplicateInput(unlocker.box_id.to_hex()));
            }
        }
        let key =
            VerifyingKey::from_bytes(&self.sender).map_err(|_| ConsensusError::MalformedKey)?;
        let sig =
            Signature::from_slice(&self.signature).map_err(|_| ConsensusError::InvalidSignature)?;
        key.verify(&self.message_bytes(), &sig)
            .map_err(|_| ConsensusError::InvalidSignature)
    }
}
