//! OBELISK Versioned Storage
//!
//! A versioned map from byte keys to byte values over redb. Every batch
//! of changes is committed under a caller-supplied version tag together
//! with undo records, so the store can roll back to any tag still inside
//! the retention window.
//!
//! The header index, the UTXO state and the authenticated prover all
//! persist through this store, partitioned by distinct key prefixes.

mod error;
mod store;

pub use error::{StorageError, StorageResult};
pub use store::{VersionTag, VersionedStore};
