//! Boxes — the immutable UTXOs of the chain
//!
//! A box is identified by the hash of its serialized form and discriminated
//! by a type byte. `AssetBox` and `CoinbaseBox` are locked to an account
//! key; `OpenBox` is the fee box, spendable by anyone once its unlock
//! height is reached.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, ConsensusResult};
use crate::transaction::Transaction;
use crate::types::{BoxId, Height};

/// Type discriminant of [`AssetBox`]
pub const ASSET_BOX_TYPE_ID: u8 = 1;
/// Type discriminant of [`OpenBox`]
pub const OPEN_BOX_TYPE_ID: u8 = 2;
/// Type discriminant of [`CoinbaseBox`]
pub const COINBASE_BOX_TYPE_ID: u8 = 3;

/// Value box locked to an account key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBox {
    /// Owning account public key
    pub proposition: [u8; 32],
    /// Disambiguating nonce chosen by the creating transaction
    pub nonce: u64,
    /// Amount carried
    pub amount: u64,
}

/// Fee box spendable by anyone at or above its unlock height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBox {
    /// Height from which the box may be spent
    pub unlock_height: Height,
    /// Disambiguating nonce
    pub nonce: u64,
    /// Amount carried
    pub amount: u64,
}

/// Emission box created by the coinbase transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinbaseBox {
    /// Miner public key the reward is locked to
    pub proposition: [u8; 32],
    /// Disambiguating nonce
    pub nonce: u64,
    /// Amount carried
    pub amount: u64,
}

/// Any box variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateBox {
    Asset(AssetBox),
    Open(OpenBox),
    Coinbase(CoinbaseBox),
}

/// Context a box is unlocked against
pub struct UnlockContext<'a> {
    /// The spending transaction
    pub transaction: &'a Transaction,
    /// Height of the block being applied
    pub height: Height,
}

impl StateBox {
    /// Type discriminant byte
    pub fn type_id(&self) -> u8 {
        match self {
            StateBox::Asset(_) => ASSET_BOX_TYPE_ID,
            StateBox::Open(_) => OPEN_BOX_TYPE_ID,
            StateBox::Coinbase(_) => COINBASE_BOX_TYPE_ID,
        }
    }

    /// Amount carried by the box
    pub fn amount(&self) -> u64 {
        match self {
            StateBox::Asset(b) => b.amount,
            StateBox::Open(b) => b.amount,
            StateBox::Coinbase(b) => b.amount,
        }
    }

    /// Canonical serialized form: type byte followed by the fixed-width
    /// fields. This is the value stored in the authenticated tree.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(49);
        out.push(self.type_id());
        match self {
            StateBox::Asset(b) => {
                out.extend_from_slice(&b.proposition);
                out.extend_from_slice(&b.nonce.to_be_bytes());
                out.extend_from_slice(&b.amount.to_be_bytes());
            }
            StateBox::Open(b) => {
                out.extend_from_slice(&b.unlock_height.to_be_bytes());
                out.extend_from_slice(&b.nonce.to_be_bytes());
                out.extend_from_slice(&b.amount.to_be_bytes());
            }
            StateBox::Coinbase(b) => {
                out.extend_from_slice(&b.proposition);
                out.extend_from_slice(&b.nonce.to_be_bytes());
                out.extend_from_slice(&b.amount.to_be_bytes());
            }
        }
        out
    }

    /// Box identifier: hash of the serialized form
    pub fn id(&self) -> BoxId {
        BoxId::from_bytes(obelisk_hash::hash(&self.bytes()))
    }

    /// Attempt to unlock the box with the supplied proof in the given
    /// context. Account-locked boxes accept an Ed25519 signature over the
    /// spending transaction's message bytes — either the unlocker proof
    /// or, absent one, the transaction-level signature when the sender key
    /// matches the proposition. Open boxes unlock by height alone.
    pub fn unlock_try(&self, proof: Option<&[u8]>, ctx: &UnlockContext<'_>) -> ConsensusResult<()> {
        match self {
            StateBox::Open(b) => {
                if ctx.height < b.unlock_height {
                    return Err(ConsensusError::HeightLock {
                        required: b.unlock_height,
                        current: ctx.height,
                    });
                }
                Ok(())
            }
            StateBox::Asset(AssetBox { proposition, .. })
            | StateBox::Coinbase(CoinbaseBox { proposition, .. }) => {
                let key = VerifyingKey::from_bytes(proposition)
                    .map_err(|_| ConsensusError::MalformedKey)?;
                let sig_bytes = match proof {
                    Some(bytes) => bytes,
                    None if ctx.transaction.sender == *proposition => {
                        ctx.transaction.signature.as_slice()
                    }
                    None => {
                        return Err(ConsensusError::UnlockFailed(
                            self.id().to_hex(),
                            "no proof and sender key does not match".into(),
                        ))
                    }
                };
                let sig = Signature::from_slice(sig_bytes)
                    .map_err(|_| ConsensusError::InvalidSignature)?;
                key.verify(&ctx.transaction.message_bytes(), &sig)
                    .map_err(|_| ConsensusError::InvalidSignature)
            }
        }
    }
}

/// Decode a stored box from its serialized form, dispatching on the type
/// discriminant. This is the decoder the UTXO state runs on every value it
/// reads back from the authenticated tree.
pub fn parse_box_bytes(bytes: &[u8], type_id: u8) -> ConsensusResult<StateBox> {
    let read_u64 = |slice: &[u8], at: usize| -> ConsensusResult<u64> {
        slice
            .get(at..at + 8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| ConsensusError::MalformedBox("truncated integer field".into()))
    };
    let read_key = |slice: &[u8]| -> ConsensusResult<[u8; 32]> {
        slice
            .get(..32)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ConsensusError::MalformedBox("truncated proposition".into()))
    };

    match type_id {
        ASSET_BOX_TYPE_ID => Ok(StateBox::Asset(AssetBox {
            proposition: read_key(bytes)?,
            nonce: read_u64(bytes, 32)?,
            amount: read_u64(bytes, 40)?,
        })),
        OPEN_BOX_TYPE_ID => Ok(StateBox::Open(OpenBox {
            unlock_height: read_u64(bytes, 0)?,
            nonce: read_u64(bytes, 8)?,
            amount: read_u64(bytes, 16)?,
        })),
        COINBASE_BOX_TYPE_ID => Ok(StateBox::Coinbase(CoinbaseBox {
            proposition: read_key(bytes)?,
            nonce: read_u64(bytes, 32)?,
            amount: read_u64(bytes, 40)?,
        })),
        other => Err(ConsensusError::UnknownBoxType(other)),
    }
}
