//! Block headers
//!
//! A header commits to its parent, the post-application state root, the
//! payload and AD-proof sections, the difficulty it was mined at and the
//! proof-of-work nonce. Its identifier is the BLAKE3 hash of the unsigned
//! header bytes; the same hash is the value checked against the
//! difficulty target, and the miner signature covers it as well.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::types::{Difficulty, Height, ModifierId, StateDigest};

/// Parent identifier of the genesis header
pub const GENESIS_PARENT_ID: ModifierId = ModifierId([0u8; 32]);

/// Height of the genesis block
pub const GENESIS_HEIGHT: Height = 0;

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Identifier of the parent header
    pub parent_id: ModifierId,
    /// Height of this header
    pub height: Height,
    /// Timestamp in milliseconds since the epoch
    pub timestamp: u64,
    /// Difficulty this header was mined at
    pub difficulty: Difficulty,
    /// State digest after applying this block's transactions
    pub state_root: StateDigest,
    /// Digest of the serialized AD proofs
    pub ad_proofs_root: [u8; 32],
    /// Identifier of the payload section
    pub payload_id: ModifierId,
    /// Identifier of the AD-proofs section
    pub ad_proofs_id: ModifierId,
    /// Proof-of-work nonce
    pub nonce: u64,
    /// Miner public key
    pub miner_pk: [u8; 32],
    /// Miner signature over the unsigned header bytes
    pub signature: Vec<u8>,
}

impl Header {
    /// Canonical unsigned header bytes: every field except the signature,
    /// fixed-width, in declaration order.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 8 + 16 + 33 + 32 + 32 + 32 + 8 + 32);
        out.extend_from_slice(self.parent_id.as_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.difficulty.to_be_bytes());
        out.extend_from_slice(&self.state_root.to_bytes());
        out.extend_from_slice(&self.ad_proofs_root);
        out.extend_from_slice(self.payload_id.as_bytes());
        out.extend_from_slice(self.ad_proofs_id.as_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.miner_pk);
        out
    }

    /// Header identifier: hash of the unsigned bytes. The same value is
    /// checked against the difficulty target, so searching nonces moves
    /// the identifier.
    pub fn id(&self) -> ModifierId {
        ModifierId::from_bytes(obelisk_hash::hash(&self.unsigned_bytes()))
    }

    /// Whether this is the genesis header
    pub fn is_genesis(&self) -> bool {
        self.parent_id == GENESIS_PARENT_ID
    }

    /// Sign the header with the miner key, filling `miner_pk` and
    /// `signature`.
    pub fn sign(&mut self, key: &SigningKey) {
        self.miner_pk = key.verifying_key().to_bytes();
        let sig = key.sign(&self.unsigned_bytes());
        self.signature = sig.to_bytes().to_vec();
    }

    /// Verify the miner signature against `miner_pk`
    pub fn verify_signature(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.miner_pk) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&self.signature) else {
            return false;
        };
        key.verify(&self.unsigned_bytes(), &sig).is_ok()
    }
}
