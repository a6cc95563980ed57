//! Blocks and block sections
//!
//! A block is a header plus its payload (the transaction sequence) and,
//! when the node runs with transaction verification, the serialized AD
//! proofs witnessing the state transition.

use serde::{Deserialize, Serialize};

use crate::header::Header;
use crate::transaction::Transaction;
use crate::types::{Height, ModifierId};

/// The transaction section of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payload {
    /// Transactions in application order
    pub transactions: Vec<Transaction>,
}

impl Payload {
    /// Create a payload from a transaction sequence
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    /// Payload identifier: hash over the contained transaction bytes
    pub fn id(&self) -> ModifierId {
        let mut hasher = obelisk_hash::blake3::Hasher::new();
        hasher.update(b"payload");
        for tx in &self.transactions {
            hasher.update(&tx.message_bytes());
        }
        ModifierId::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Total serialized length of the contained transactions
    pub fn serialized_length(&self) -> usize {
        self.transactions
            .iter()
            .map(Transaction::serialized_length)
            .sum()
    }
}

/// Serialized authenticated-data-structure proofs for one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdProofs {
    /// The serialized batch proof
    pub proof_bytes: Vec<u8>,
}

impl AdProofs {
    /// Wrap serialized proof bytes
    pub fn new(proof_bytes: Vec<u8>) -> Self {
        Self { proof_bytes }
    }

    /// Digest of the serialized proof, committed to by the header
    pub fn digest(&self) -> [u8; 32] {
        obelisk_hash::hash(&self.proof_bytes)
    }

    /// Modifier identifier of the AD-proofs section
    pub fn id(&self) -> ModifierId {
        ModifierId::from_bytes(obelisk_hash::hash_many(&[b"proofs", &self.digest()]))
    }
}

/// A full block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: Header,
    /// Transaction section
    pub payload: Payload,
    /// AD proofs, when present
    pub ad_proofs: Option<AdProofs>,
}

impl Block {
    /// Create a new block
    pub fn new(header: Header, payload: Payload, ad_proofs: Option<AdProofs>) -> Self {
        Self {
            header,
            payload,
            ad_proofs,
        }
    }

    /// Block identifier (the header identifier)
    pub fn id(&self) -> ModifierId {
        self.header.id()
    }

    /// Block height
    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Check that the carried sections match the header commitments
    pub fn sections_match_header(&self) -> bool {
        if self.payload.id() != self.header.payload_id {
            return false;
        }
        match &self.ad_proofs {
            Some(proofs) => {
                proofs.digest() == self.header.ad_proofs_root
                    && proofs.id() == self.header.ad_proofs_id
            }
            None => true,
        }
    }
}
