//! OBELISK Authenticated UTXO State
//!
//! The spendable half of consensus: an authenticated AVL+ tree over the
//! box set, a batch prover producing 33-byte root digests and serialized
//! proofs, and the UTXO state machine that applies block transactions
//! under consensus rules with digest-indexed rollback.

mod error;
pub mod prover;
pub mod tree;
pub mod utxo;

pub use error::{StateError, StateResult};
pub use prover::{Operation, PersistentProver};
pub use utxo::{UtxoState, MAX_ROLLBACK_DEPTH};
