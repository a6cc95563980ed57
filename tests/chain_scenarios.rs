//! End-to-end header chain scenarios: genesis, reorgs and difficulty
//! retargeting exercised through the header processor.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use obelisk::consensus::types::StateDigest;
use obelisk::consensus::{Header, ManualClock, ModifierId, GENESIS_PARENT_ID};
use obelisk::storage::VersionedStore;
use obelisk::HeaderProcessor;
use obelisk_node::settings::{ChainSettings, CoreSettings};
use rand::rngs::OsRng;
use tempfile::tempdir;

const NOW: u64 = 1_700_000_000_000;

fn settings() -> ChainSettings {
    ChainSettings {
        initial_difficulty: 1,
        epoch_length: 16,
        retargeting_epochs_qty: 4,
        desired_block_interval_ms: 1_000,
        max_time_drift_ms: u64::MAX / 2,
        max_rollback_depth: 2_000,
        ..ChainSettings::default()
    }
}

fn open_processor() -> (HeaderProcessor, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let store = Arc::new(VersionedStore::open(dir.path().join("chain.db")).unwrap());
    let processor = HeaderProcessor::new(
        store,
        settings(),
        CoreSettings::default(),
        Arc::new(ManualClock::new(NOW)),
    );
    (processor, dir)
}

fn mk_header(
    parent: Option<&Header>,
    timestamp: u64,
    difficulty: u128,
    key: &SigningKey,
    salt: u64,
) -> Header {
    let mut header = Header {
        parent_id: parent.map(Header::id).unwrap_or(GENESIS_PARENT_ID),
        height: parent.map(|p| p.height + 1).unwrap_or(0),
        timestamp,
        difficulty,
        state_root: StateDigest::default(),
        ad_proofs_root: [0u8; 32],
        payload_id: ModifierId::from_bytes(obelisk_hash::hash(&salt.to_be_bytes())),
        ad_proofs_id: ModifierId::default(),
        nonce: salt,
        miner_pk: [0u8; 32],
        signature: vec![],
    };
    header.sign(key);
    header
}

/// S1: applying a genesis header to an empty chain makes it best with
/// its own difficulty as score.
#[test]
fn genesis_apply() {
    let (processor, _dir) = open_processor();
    let key = SigningKey::generate(&mut OsRng);
    let genesis = mk_header(None, NOW, 1, &key, 0);

    processor.validate(&genesis).unwrap();
    let progress = processor.process(&genesis).unwrap();

    assert_eq!(processor.best_header_id().unwrap(), Some(genesis.id()));
    assert_eq!(processor.best_height().unwrap(), Some(0));
    assert_eq!(processor.score_of(&genesis.id()).unwrap(), Some(1));
    assert_eq!(
        progress.best_header.as_ref().map(Header::id),
        Some(genesis.id())
    );
}

/// S2: a heavier fork becomes best, leads every height row, and the
/// displaced chain stays known at the tail of its rows.
#[test]
fn reorg_to_heavier_fork() {
    let (processor, _dir) = open_processor();
    let key = SigningKey::generate(&mut OsRng);

    let genesis = mk_header(None, NOW, 1, &key, 0);
    processor.process(&genesis).unwrap();

    let a = mk_header(Some(&genesis), NOW + 1_000, 1, &key, 1);
    processor.process(&a).unwrap();
    let b = mk_header(Some(&a), NOW + 2_000, 1, &key, 2);
    processor.process(&b).unwrap();

    let a2 = mk_header(Some(&genesis), NOW + 1_000, 1, &key, 10);
    processor.process(&a2).unwrap();
    let b2 = mk_header(Some(&a2), NOW + 2_000, 1, &key, 11);
    processor.process(&b2).unwrap();
    let c2 = mk_header(Some(&b2), NOW + 3_000, 1, &key, 12);
    let progress = processor.process(&c2).unwrap();

    assert_eq!(processor.best_header_id().unwrap(), Some(c2.id()));
    assert_eq!(progress.rollback_to, Some(genesis.id()));
    assert_eq!(
        processor.header_ids_at_height(1).unwrap(),
        vec![a2.id(), a.id()]
    );
    assert_eq!(
        processor.header_ids_at_height(2).unwrap(),
        vec![b2.id(), b.id()]
    );
    assert!(processor.contains(&a.id()).unwrap());
    assert!(processor.contains(&b.id()).unwrap());
}

/// Universal invariant: score is parent score plus own difficulty along
/// any chain, and every stored height row starts with the best chain.
#[test]
fn score_and_height_row_invariants() {
    let (processor, _dir) = open_processor();
    let key = SigningKey::generate(&mut OsRng);

    let genesis = mk_header(None, NOW, 3, &key, 0);
    processor.process(&genesis).unwrap();
    let mut tip = genesis;
    let mut expected_score = 3u128;
    for i in 0..20u64 {
        let difficulty = 1 + (i % 4) as u128;
        let next = mk_header(Some(&tip), NOW + (i + 1) * 1_000, difficulty, &key, 100 + i);
        processor.process(&next).unwrap();
        expected_score += difficulty;
        assert_eq!(processor.score_of(&next.id()).unwrap(), Some(expected_score));
        tip = next;
    }

    for height in 0..=20u64 {
        let row = processor.header_ids_at_height(height).unwrap();
        assert!(!row.is_empty());
        assert!(processor.is_on_best_chain(&row[0]).unwrap());
    }
}

/// Property: a header and its fork sibling accepted in either order
/// produce the same best header.
#[test]
fn fork_arrival_order_does_not_change_best() {
    let key = SigningKey::generate(&mut OsRng);
    let genesis = mk_header(None, NOW, 1, &key, 0);
    let light = mk_header(Some(&genesis), NOW + 1_000, 1, &key, 1);
    let heavy = mk_header(Some(&genesis), NOW + 1_000, 4, &key, 2);

    for order in [[&light, &heavy], [&heavy, &light]] {
        let (processor, _dir) = open_processor();
        processor.process(&genesis).unwrap();
        for header in order {
            processor.process(header).unwrap();
        }
        assert_eq!(processor.best_header_id().unwrap(), Some(heavy.id()));
    }
}

/// S6: a long chain whose blocks arrive at twice the desired interval
/// retargets to roughly half the difficulty.
#[test]
fn retarget_halves_difficulty_on_slow_chain() {
    let (processor, _dir) = open_processor();
    let key = SigningKey::generate(&mut OsRng);

    const DIFFICULTY: u128 = 1_000_000;
    const INTERVAL: u64 = 2_000; // twice the desired 1000 ms

    let genesis = mk_header(None, NOW, DIFFICULTY, &key, 0);
    processor.process(&genesis).unwrap();
    let mut tip = genesis;
    for i in 1..1024u64 {
        let next = mk_header(Some(&tip), NOW + i * INTERVAL, DIFFICULTY, &key, i);
        processor.process(&next).unwrap();
        tip = next;
    }

    let required = processor.required_difficulty_after(&tip).unwrap();
    let expected = DIFFICULTY / 2;
    let tolerance = expected / 1_000;
    assert!(
        required.abs_diff(expected) <= tolerance,
        "required {required}, expected about {expected}"
    );
}

/// Early chain: difficulty queries below height three return the
/// configured initial difficulty.
#[test]
fn early_chain_uses_initial_difficulty() {
    let (processor, _dir) = open_processor();
    let key = SigningKey::generate(&mut OsRng);
    let genesis = mk_header(None, NOW, 1, &key, 0);
    processor.process(&genesis).unwrap();

    assert_eq!(processor.required_difficulty_after(&genesis).unwrap(), 1);
}
