//! Property-based tests over the core invariants: authenticated tree
//! behaviour, prover rollback idempotence, proof-of-work monotonicity
//! and mempool bounds.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use obelisk::consensus::{validate_pow, AssetBox, BoxId, ModifierId, StateBox, Transaction, Unlocker};
use obelisk::mempool::{Mempool, MempoolConfig};
use obelisk::state::prover::{Operation, PersistentProver};
use obelisk::state::tree;
use obelisk::storage::VersionedStore;
use proptest::prelude::*;
use rand::rngs::OsRng;
use tempfile::tempdir;

fn bytes32() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

fn unique_keys(max: usize) -> impl Strategy<Value = Vec<[u8; 32]>> {
    prop::collection::hash_set(bytes32(), 1..max).prop_map(|set| set.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Inserting a key set and looking every key up round-trips, and
    /// removing everything restores the empty digest.
    #[test]
    fn tree_insert_lookup_remove(keys in unique_keys(64)) {
        let mut root = None;
        for (i, key) in keys.iter().enumerate() {
            root = Some(tree::insert(&root, *key, vec![i as u8]).unwrap());
        }
        for (i, key) in keys.iter().enumerate() {
            prop_assert_eq!(tree::lookup(&root, key), Some(vec![i as u8]));
        }
        for key in &keys {
            root = tree::remove(&root, key).unwrap();
        }
        prop_assert!(root.is_none());
        prop_assert_eq!(tree::digest(&root), tree::empty_digest());
    }

    /// The tree height stays logarithmic in the leaf count.
    #[test]
    fn tree_stays_balanced(keys in unique_keys(128)) {
        let mut root = None;
        for key in &keys {
            root = Some(tree::insert(&root, *key, vec![1]).unwrap());
        }
        let height = root.as_ref().map(|node| node.height()).unwrap_or(0) as u32;
        // An AVL tree over n leaves is no taller than ~1.45 log2(n) + 2.
        let bound = 2 + (keys.len() as f64).log2().ceil() as u32 * 3 / 2;
        prop_assert!(height <= bound.max(2), "height {} over {} leaves", height, keys.len());
    }

    /// Rollback to a committed digest, reapplying a batch and rolling
    /// back again lands on the exact same digest.
    #[test]
    fn prover_rollback_is_idempotent(
        base in unique_keys(16),
        batch in unique_keys(16),
    ) {
        let dir = tempdir().unwrap();
        let store = Arc::new(VersionedStore::open(dir.path().join("p.db")).unwrap());
        let mut prover = PersistentProver::open(store).unwrap();

        for key in &base {
            prover.perform_one_operation(&Operation::Insert(*key, vec![0])).unwrap();
        }
        let committed = prover.digest();
        prover.generate_proof_and_update_storage(vec![]).unwrap();

        let fresh: Vec<[u8; 32]> = batch.iter().filter(|k| !base.contains(*k)).cloned().collect();
        prop_assume!(!fresh.is_empty());

        for key in &fresh {
            prover.perform_one_operation(&Operation::Insert(*key, vec![1])).unwrap();
        }
        prover.generate_proof_and_update_storage(vec![]).unwrap();

        prover.rollback(&committed).unwrap();
        let first_rollback = prover.digest();

        for key in &fresh {
            prover.perform_one_operation(&Operation::Insert(*key, vec![1])).unwrap();
        }
        prover.generate_proof_and_update_storage(vec![]).unwrap();
        prover.rollback(&committed).unwrap();

        prop_assert_eq!(prover.digest(), first_rollback);
        prop_assert_eq!(prover.digest(), committed);
    }

    /// A hash passing at some difficulty passes at every lower one.
    #[test]
    fn pow_monotone_in_difficulty(hash in bytes32(), difficulty in 1u128..1_000_000) {
        let id = ModifierId::from_bytes(hash);
        if validate_pow(&id, difficulty) {
            prop_assert!(validate_pow(&id, difficulty / 2 + 1));
            prop_assert!(validate_pow(&id, 1));
        } else {
            prop_assert!(!validate_pow(&id, difficulty * 2));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// The pool never exceeds its capacity, whatever is thrown at it.
    #[test]
    fn mempool_respects_capacity(batch_sizes in prop::collection::vec(1usize..30, 1..6)) {
        let pool = Mempool::with_clock(
            MempoolConfig {
                max_capacity: 25,
                utx_max_age: Duration::from_secs(3_600),
                cleanup_interval: Duration::from_secs(3_600),
            },
            Arc::new(obelisk::consensus::ManualClock::new(1_000_000)),
        );
        let key = SigningKey::generate(&mut OsRng);

        let mut nonce = 0u64;
        for size in batch_sizes {
            let txs: Vec<Transaction> = (0..size)
                .map(|_| {
                    nonce += 1;
                    let mut tx = Transaction {
                        unlockers: vec![Unlocker {
                            box_id: BoxId::from_bytes([(nonce % 251) as u8; 32]),
                            proof: None,
                        }],
                        outputs: vec![StateBox::Asset(AssetBox {
                            proposition: key.verifying_key().to_bytes(),
                            nonce,
                            amount: 1,
                        })],
                        timestamp: 1_000 + nonce,
                        sender: key.verifying_key().to_bytes(),
                        signature: vec![],
                    };
                    tx.sign(&key);
                    tx
                })
                .collect();
            let _ = pool.put_many(txs);
            prop_assert!(pool.len() <= 25);
        }
    }
}
