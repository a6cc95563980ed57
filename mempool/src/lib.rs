//! OBELISK Mempool
//!
//! A bounded pool of semantically valid unconfirmed transactions keyed
//! by transaction identifier, with arrival-order eviction, a periodic
//! expiry sweep, and assembly waiters: completion handles that resolve
//! once every requested transaction has been admitted.
//!
//! One lock guards the transaction map and the waiters table together;
//! waiter handles collected under the lock are resolved after it is
//! released so admission never runs foreign code in its critical
//! section.

mod error;

pub use error::{MempoolError, MempoolResult};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use obelisk_consensus::{NetworkTime, SystemClock, Transaction, TxId};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Mempool configuration
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of unconfirmed transactions
    pub max_capacity: usize,
    /// Age beyond which an unconfirmed transaction expires
    pub utx_max_age: Duration,
    /// Period of the expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            utx_max_age: Duration::from_secs(1_000 * 60),
            cleanup_interval: Duration::from_secs(180 * 60),
        }
    }
}

/// A pending assembly request: resolves once every requested identifier
/// has been admitted.
struct Waiter {
    /// Identifiers not yet admitted
    pending: HashSet<TxId>,
    /// The original request, in caller order
    requested: Vec<TxId>,
    sender: oneshot::Sender<Vec<Transaction>>,
}

/// State behind the single mempool lock
#[derive(Default)]
struct Inner {
    unconfirmed: HashMap<TxId, Transaction>,
    /// Arrival order, for snapshots and overflow eviction
    order: VecDeque<TxId>,
    waiters: Vec<Waiter>,
}

/// Snapshot of mempool counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolStats {
    /// Transactions currently pooled
    pub size: usize,
    /// Configured capacity
    pub capacity: usize,
    /// Assembly requests still pending
    pub waiters: usize,
}

/// The unconfirmed transaction pool
#[derive(Clone)]
pub struct Mempool {
    config: MempoolConfig,
    clock: Arc<dyn NetworkTime>,
    inner: Arc<Mutex<Inner>>,
}

impl Mempool {
    /// Create a mempool with the given configuration
    pub fn new(config: MempoolConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a mempool with an explicit time source
    pub fn with_clock(config: MempoolConfig, clock: Arc<dyn NetworkTime>) -> Self {
        Self {
            config,
            clock,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Admit one transaction
    pub fn put(&self, tx: Transaction) -> MempoolResult<()> {
        self.put_many(vec![tx]).map(|_| ())
    }

    /// Admit a batch: drop transactions that fail semantic validity or
    /// already exist, admit the remainder up to capacity (tail truncated
    /// silently on overflow). Fails only when nothing was admitted.
    pub fn put_many(&self, txs: Vec<Transaction>) -> MempoolResult<Vec<TxId>> {
        if txs.is_empty() {
            return Err(MempoolError::NothingAdmitted);
        }
        let candidates: Vec<Transaction> = txs
            .into_iter()
            .filter(|tx| tx.semantic_validity().is_ok())
            .collect();
        let admitted = self.put_without_check(candidates);
        if admitted.is_empty() {
            Err(MempoolError::NothingAdmitted)
        } else {
            Ok(admitted)
        }
    }

    /// Insert without validation, then resolve any waiter whose pending
    /// set the newly admitted identifiers empty out. Returns the admitted
    /// identifiers in insertion order.
    pub fn put_without_check(&self, txs: Vec<Transaction>) -> Vec<TxId> {
        let mut resolved: Vec<(oneshot::Sender<Vec<Transaction>>, Vec<Transaction>)> = Vec::new();
        let admitted = {
            let mut inner = self.inner.lock();
            let mut admitted = Vec::new();
            for tx in txs {
                if inner.unconfirmed.len() >= self.config.max_capacity {
                    debug!(dropped = %tx.id(), "Mempool full, truncating batch");
                    break;
                }
                let id = tx.id();
                if inner.unconfirmed.contains_key(&id) {
                    continue;
                }
                inner.unconfirmed.insert(id, tx);
                inner.order.push_back(id);
                admitted.push(id);
            }

            if !admitted.is_empty() {
                let added: HashSet<TxId> = admitted.iter().copied().collect();
                let waiters = std::mem::take(&mut inner.waiters);
                for mut waiter in waiters {
                    waiter.pending.retain(|id| !added.contains(id));
                    if waiter.pending.is_empty() {
                        let txs = waiter
                            .requested
                            .iter()
                            .filter_map(|id| inner.unconfirmed.get(id).cloned())
                            .collect();
                        resolved.push((waiter.sender, txs));
                    } else {
                        inner.waiters.push(waiter);
                    }
                }
            }
            admitted
        };

        // Completion is signalled outside the admission lock.
        for (sender, txs) in resolved {
            let _ = sender.send(txs);
        }
        admitted
    }

    /// Completion handle resolving once every identifier in `ids` is or
    /// becomes present, with the transactions in request order. The
    /// caller supplies its own timeout.
    pub fn wait_for_all(&self, ids: Vec<TxId>) -> oneshot::Receiver<Vec<Transaction>> {
        let (sender, receiver) = oneshot::channel();
        let immediate = {
            let mut inner = self.inner.lock();
            let pending: HashSet<TxId> = ids
                .iter()
                .filter(|id| !inner.unconfirmed.contains_key(id))
                .copied()
                .collect();
            if pending.is_empty() {
                let txs = ids
                    .iter()
                    .filter_map(|id| inner.unconfirmed.get(id).cloned())
                    .collect();
                Some((sender, txs))
            } else {
                inner.waiters.push(Waiter {
                    pending,
                    requested: ids,
                    sender,
                });
                None
            }
        };
        if let Some((sender, txs)) = immediate {
            let _ = sender.send(txs);
        }
        receiver
    }

    /// Best-effort removal of one transaction
    pub fn remove(&self, tx: &Transaction) {
        self.remove_by_id(&tx.id());
    }

    /// Best-effort removal by identifier
    pub fn remove_by_id(&self, id: &TxId) {
        let mut inner = self.inner.lock();
        if inner.unconfirmed.remove(id).is_some() {
            inner.order.retain(|entry| entry != id);
        }
    }

    /// Non-blocking batch removal, typically after block inclusion
    pub fn remove_async(&self, txs: Vec<Transaction>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut inner = pool.inner.lock();
            let ids: HashSet<TxId> = txs.iter().map(Transaction::id).collect();
            inner.unconfirmed.retain(|id, _| !ids.contains(id));
            inner.order.retain(|id| !ids.contains(id));
        })
    }

    /// Snapshot of up to `n` transactions in arrival order
    pub fn take(&self, n: usize) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.unconfirmed.get(id).cloned())
            .take(n)
            .collect()
    }

    /// Snapshot of every pooled transaction in arrival order
    pub fn take_all(&self) -> Vec<Transaction> {
        self.take(usize::MAX)
    }

    /// Destructively retain only the transactions matching the predicate
    pub fn filter<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Transaction) -> bool,
    {
        let mut inner = self.inner.lock();
        let before = inner.unconfirmed.len();
        inner.unconfirmed.retain(|_, tx| predicate(tx));
        let remaining: HashSet<TxId> = inner.unconfirmed.keys().copied().collect();
        inner.order.retain(|id| remaining.contains(id));
        before - inner.unconfirmed.len()
    }

    /// Whether a transaction is pooled
    pub fn contains(&self, id: &TxId) -> bool {
        self.inner.lock().unconfirmed.contains_key(id)
    }

    /// Number of pooled transactions
    pub fn len(&self) -> usize {
        self.inner.lock().unconfirmed.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unconfirmed.is_empty()
    }

    /// Counter snapshot
    pub fn stats(&self) -> MempoolStats {
        let inner = self.inner.lock();
        MempoolStats {
            size: inner.unconfirmed.len(),
            capacity: self.config.max_capacity,
            waiters: inner.waiters.len(),
        }
    }

    /// Drop every transaction older than the configured maximum age.
    /// Returns the number evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let max_age = self.config.utx_max_age.as_millis() as u64;
        let evicted = self.filter(|tx| now.saturating_sub(tx.timestamp) <= max_age);
        if evicted > 0 {
            info!(evicted, "Swept expired transactions");
        }
        evicted
    }

    /// Spawn the periodic expiry sweep. The task runs until the returned
    /// handle is aborted; the owning component aborts it on teardown.
    pub fn spawn_cleanup(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.sweep_expired();
            }
        })
    }
}
