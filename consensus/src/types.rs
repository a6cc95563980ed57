//! Core identifier and digest types
//!
//! All identifiers are opaque 32-byte values ordered by unsigned
//! lexicographic comparison; maps throughout the node key on these
//! newtypes directly, so equality is always content equality.

use serde::{Deserialize, Serialize};

/// Length of every identifier in bytes
pub const ID_LENGTH: usize = 32;

/// Block height
pub type Height = u64;

/// Difficulty and cumulative chain score, serialized big-endian
pub type Difficulty = u128;

/// Identifier of a block-section modifier (header, payload, AD proofs)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ModifierId(pub [u8; ID_LENGTH]);

/// Identifier of a box (UTXO)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BoxId(pub [u8; ID_LENGTH]);

/// Identifier of a transaction
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TxId(pub [u8; ID_LENGTH]);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes
            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }

            /// Convert to hex string
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

impl_id!(ModifierId);
impl_id!(BoxId);
impl_id!(TxId);

/// The kind of a block-section modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModifierType {
    Header,
    Payload,
    AdProofs,
}

impl ModifierType {
    /// Wire/persistence discriminant byte
    pub fn type_id(&self) -> u8 {
        match self {
            ModifierType::Header => 101,
            ModifierType::Payload => 102,
            ModifierType::AdProofs => 104,
        }
    }
}

/// Commitment to the entire UTXO set: 32-byte root label plus the
/// authenticated tree height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct StateDigest {
    /// Root node label
    pub root: [u8; ID_LENGTH],
    /// Height of the authenticated tree
    pub tree_height: u8,
}

impl StateDigest {
    /// Create from root label and tree height
    pub fn new(root: [u8; ID_LENGTH], tree_height: u8) -> Self {
        Self { root, tree_height }
    }

    /// Serialize to the canonical 33-byte form
    pub fn to_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[..32].copy_from_slice(&self.root);
        out[32] = self.tree_height;
        out
    }

    /// Parse from the canonical 33-byte form
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 33 {
            return None;
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(&bytes[..32]);
        Some(Self {
            root,
            tree_height: bytes[32],
        })
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl std::fmt::Display for StateDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering_is_lexicographic() {
        let low = ModifierId::from_bytes([0u8; 32]);
        let mut high_bytes = [0u8; 32];
        high_bytes[0] = 0xFF;
        let high = ModifierId::from_bytes(high_bytes);
        assert!(low < high);
    }

    #[test]
    fn test_state_digest_round_trip() {
        let digest = StateDigest::new([7u8; 32], 12);
        let bytes = digest.to_bytes();
        assert_eq!(bytes.len(), 33);
        assert_eq!(StateDigest::from_bytes(&bytes), Some(digest));
        assert_eq!(StateDigest::from_bytes(&bytes[..32]), None);
    }
}
