//! OBELISK Node Core
//!
//! A proof-of-work UTXO blockchain node core: the subsystems that decide
//! what is canonical and what is spendable.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         OBELISK Node                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Header     │   │    UTXO      │   │   Mempool    │         │
//! │  │  Processor   │   │    State     │   │              │         │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘         │
//! │         │   ProgressInfo   │                  │                 │
//! │         └────────┬─────────┘                  │                 │
//! │                  │                            │                 │
//! │         ┌────────▼────────┐          ┌────────▼───────┐         │
//! │         │    Node View    │◄─────────│     Miner      │         │
//! │         └────────┬────────┘  mined   └────────────────┘         │
//! │                  │           blocks                             │
//! │         ┌────────▼────────┐                                     │
//! │         │ Versioned Store │                                     │
//! │         └─────────────────┘                                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Incoming headers flow through the header processor, which orders
//! them, selects the best chain and names the modifiers to download.
//! Block payloads advance the authenticated UTXO state, whose digest
//! must equal the header's declared state root. User transactions
//! buffer in the mempool; the miner assembles candidates from all
//! three and feeds winning blocks back in as locally generated
//! modifiers.

pub mod logging;
pub mod node;

pub use node::{NodeError, NodeResult, NodeView, StatusReport};

pub use obelisk_consensus as consensus;
pub use obelisk_mempool as mempool;
pub use obelisk_node::{
    ChainError, HeaderProcessor, LocallyGeneratedModifier, Miner, MinerCommand, MinerHandle,
    MinerState, NodeSettings, ProgressInfo, StateMode,
};
pub use obelisk_state as state;
pub use obelisk_storage as storage;
