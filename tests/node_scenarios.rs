//! End-to-end node view scenarios: block application, double-spend
//! rejection, reorgs with state rollback and the status surface.

use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use obelisk::consensus::{
    AdProofs, AssetBox, Block, CoinbaseBox, Header, ManualClock, ModifierId, Payload, StateBox,
    Transaction, Unlocker,
};
use obelisk::state::UtxoState;
use obelisk::{NodeError, NodeView};
use obelisk_node::settings::NodeSettings;
use rand::rngs::OsRng;
use tempfile::tempdir;

const NOW: u64 = 1_700_000_000_000;

fn node_settings() -> NodeSettings {
    let mut settings = NodeSettings::default();
    settings.chain.initial_difficulty = 1;
    settings.chain.max_time_drift_ms = u64::MAX / 2;
    settings
}

fn open_node(dir: &Path) -> NodeView {
    NodeView::open_with_clock(dir, node_settings(), Arc::new(ManualClock::new(NOW))).unwrap()
}

fn coinbase_tx(key: &SigningKey, nonce: u64, amount: u64) -> Transaction {
    let mut tx = Transaction {
        unlockers: vec![],
        outputs: vec![StateBox::Coinbase(CoinbaseBox {
            proposition: key.verifying_key().to_bytes(),
            nonce,
            amount,
        })],
        timestamp: NOW + nonce,
        sender: key.verifying_key().to_bytes(),
        signature: vec![],
    };
    tx.sign(key);
    tx
}

fn spend_tx(key: &SigningKey, input: &StateBox, outputs: Vec<StateBox>) -> Transaction {
    let mut tx = Transaction {
        unlockers: vec![Unlocker {
            box_id: input.id(),
            proof: None,
        }],
        outputs,
        timestamp: NOW + 500,
        sender: key.verifying_key().to_bytes(),
        signature: vec![],
    };
    tx.sign(key);
    tx
}

/// Build a block over a state snapshot so that the header commits to
/// exactly what application will compute.
fn build_block(
    state: &UtxoState,
    parent: Option<&Header>,
    txs: Vec<Transaction>,
    key: &SigningKey,
) -> Block {
    let (proof, digest) = state.proofs_for_transactions(&txs).unwrap();
    let payload = Payload::new(txs);
    let proofs = AdProofs::new(proof);
    let height = parent.map(|p| p.height + 1).unwrap_or(0);
    let mut header = Header {
        parent_id: parent.map(Header::id).unwrap_or_default(),
        height,
        timestamp: NOW + height * 1_000,
        difficulty: 1,
        state_root: digest,
        ad_proofs_root: proofs.digest(),
        payload_id: payload.id(),
        ad_proofs_id: proofs.id(),
        nonce: height,
        miner_pk: [0u8; 32],
        signature: vec![],
    };
    header.sign(key);
    Block::new(header, payload, Some(proofs))
}

fn snapshot(node: &NodeView) -> UtxoState {
    node.state().read().clone()
}

#[test]
fn genesis_block_advances_chain_and_state() {
    let dir = tempdir().unwrap();
    let node = open_node(dir.path());
    let key = SigningKey::generate(&mut OsRng);

    let genesis = build_block(&snapshot(&node), None, vec![coinbase_tx(&key, 0, 100)], &key);
    node.process_block(&genesis).unwrap();

    assert_eq!(node.chain().best_header_id().unwrap(), Some(genesis.id()));
    assert_eq!(node.chain().best_block_id().unwrap(), Some(genesis.id()));
    let state = node.state().read().clone();
    assert_eq!(state.version(), genesis.id());
    assert_eq!(state.height(), Some(0));
    assert_eq!(state.digest(), genesis.header.state_root);
}

/// S3 at the node level: a block double-spending a box is rejected and
/// the state digest stays at the pre-block root.
#[test]
fn double_spend_block_rejected() {
    let dir = tempdir().unwrap();
    let node = open_node(dir.path());
    let key = SigningKey::generate(&mut OsRng);

    let funding = coinbase_tx(&key, 0, 10);
    let funded = funding.outputs[0];
    let genesis = build_block(&snapshot(&node), None, vec![funding], &key);
    node.process_block(&genesis).unwrap();
    let pre_digest = node.state().read().digest();

    let tx1 = spend_tx(
        &key,
        &funded,
        vec![StateBox::Asset(AssetBox {
            proposition: key.verifying_key().to_bytes(),
            nonce: 1,
            amount: 10,
        })],
    );
    let tx2 = spend_tx(
        &key,
        &funded,
        vec![StateBox::Asset(AssetBox {
            proposition: key.verifying_key().to_bytes(),
            nonce: 2,
            amount: 10,
        })],
    );

    let payload = Payload::new(vec![tx1, tx2]);
    let mut header = genesis.header.clone();
    header.parent_id = genesis.id();
    header.height = 1;
    header.timestamp = NOW + 1_000;
    header.payload_id = payload.id();
    header.sign(&key);
    let block = Block::new(header, payload, None);

    let result = node.process_block(&block);
    assert!(matches!(result, Err(NodeError::State(_))));
    assert_eq!(node.state().read().digest(), pre_digest);
    // The header was reported invalid and dropped.
    assert!(!node.chain().contains(&block.id()).unwrap());
}

/// A reorg rolls the state back to the branch point and applies the
/// fork blocks from stored sections.
#[test]
fn reorg_rolls_state_and_applies_fork() {
    let main_dir = tempdir().unwrap();
    let fork_dir = tempdir().unwrap();
    let node = open_node(main_dir.path());
    let fork_node = open_node(fork_dir.path());
    let key = SigningKey::generate(&mut OsRng);

    // Shared genesis.
    let genesis = build_block(&snapshot(&node), None, vec![coinbase_tx(&key, 0, 100)], &key);
    node.process_block(&genesis).unwrap();
    fork_node.process_block(&genesis).unwrap();

    // Main chain: G <- A. Fork chain (mined elsewhere): G <- A' <- B'.
    let a = build_block(
        &snapshot(&node),
        Some(&genesis.header),
        vec![coinbase_tx(&key, 10, 100)],
        &key,
    );
    let a2 = build_block(
        &snapshot(&fork_node),
        Some(&genesis.header),
        vec![coinbase_tx(&key, 20, 100)],
        &key,
    );
    node.process_block(&a).unwrap();
    fork_node.process_block(&a2).unwrap();

    let b2 = build_block(
        &snapshot(&fork_node),
        Some(&a2.header),
        vec![coinbase_tx(&key, 21, 100)],
        &key,
    );
    fork_node.process_block(&b2).unwrap();

    // Feed the fork into the main node. A' alone ties and stays off
    // chain; B' wins and triggers the reorg.
    node.process_block(&a2).unwrap();
    assert_eq!(node.chain().best_header_id().unwrap(), Some(a.id()));

    let progress = node.process_block(&b2).unwrap();
    assert_eq!(progress.rollback_to, Some(genesis.id()));
    assert_eq!(node.chain().best_header_id().unwrap(), Some(b2.id()));
    assert_eq!(
        node.chain().header_ids_at_height(1).unwrap(),
        vec![a2.id(), a.id()]
    );

    let state = node.state().read().clone();
    assert_eq!(state.version(), b2.id());
    assert_eq!(state.height(), Some(1));
    assert_eq!(state.digest(), b2.header.state_root);
}

/// Transactions included in an applied block leave the mempool.
#[test]
fn included_transactions_are_pruned_from_mempool() {
    let dir = tempdir().unwrap();
    let node = open_node(dir.path());
    let key = SigningKey::generate(&mut OsRng);

    let funding = coinbase_tx(&key, 0, 50);
    let funded = funding.outputs[0];
    let genesis = build_block(&snapshot(&node), None, vec![funding], &key);
    node.process_block(&genesis).unwrap();

    let spend = spend_tx(
        &key,
        &funded,
        vec![StateBox::Asset(AssetBox {
            proposition: key.verifying_key().to_bytes(),
            nonce: 1,
            amount: 50,
        })],
    );
    node.submit_transaction(spend.clone()).unwrap();
    assert_eq!(node.mempool().len(), 1);

    let block = build_block(&snapshot(&node), Some(&genesis.header), vec![spend], &key);
    node.process_block(&block).unwrap();
    assert_eq!(node.mempool().len(), 0);
}

#[test]
fn status_reports_node_shape() {
    let dir = tempdir().unwrap();
    let node = open_node(dir.path());
    let key = SigningKey::generate(&mut OsRng);

    let genesis = build_block(&snapshot(&node), None, vec![coinbase_tx(&key, 0, 100)], &key);
    node.process_block(&genesis).unwrap();

    let status = node.status(None).unwrap();
    assert_eq!(status.best_header_id, Some(genesis.id().to_hex()));
    assert_eq!(status.best_block_id, Some(genesis.id().to_hex()));
    assert_eq!(status.state_height, Some(0));
    assert_eq!(status.mempool_size, 0);
    assert_eq!(status.miner_state, "disabled");

    let json = node.status_json(None).unwrap();
    assert!(json.contains("state_version"));
}

/// Reopening the node view restores the persisted chain and state.
#[test]
fn reopen_restores_persisted_view() {
    let dir = tempdir().unwrap();
    let key = SigningKey::generate(&mut OsRng);
    let genesis_id: ModifierId;
    let digest;
    {
        let node = open_node(dir.path());
        let genesis =
            build_block(&snapshot(&node), None, vec![coinbase_tx(&key, 0, 100)], &key);
        node.process_block(&genesis).unwrap();
        genesis_id = genesis.id();
        digest = node.state().read().digest();
    }

    let node = open_node(dir.path());
    assert_eq!(node.chain().best_header_id().unwrap(), Some(genesis_id));
    let state = node.state().read().clone();
    assert_eq!(state.version(), genesis_id);
    assert_eq!(state.digest(), digest);
}
