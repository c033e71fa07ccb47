//! In-flight payout work set and per-sender exclusivity.
//!
//! The store owns three pieces of shared state: the transient queue of
//! payout tasks per (chain, token), the serial-relation index (memory mark
//! plus DB write-through), and the keyed per-sender mutex that gives each
//! maker address a total order of payouts.

#![allow(dead_code)]

use async_trait::async_trait;
use eyre::Result;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::db;
use crate::types::normalize_address;

/// A payout obligation queued for scheduling, one per source deposit.
#[derive(Debug, Clone)]
pub struct PayoutTask {
    pub source_id: String,
    pub source_chain: String,
    pub source_symbol: String,
    pub source_amount: String,
    pub source_decimals: u8,
    pub target_chain: String,
    pub target_token: String,
    pub target_symbol: String,
    pub target_address: String,
    /// Raw-unit payout amount, safety code included
    pub target_amount: String,
    pub target_decimals: u8,
    /// Whether the payout is the chain's native asset (zero token address)
    pub is_native: bool,
    pub response_makers: Vec<String>,
}

/// Queue key: destination (chain, token).
pub type QueueKey = (String, String);

impl PayoutTask {
    pub fn queue_key(&self) -> QueueKey {
        (self.target_chain.clone(), normalize_address(&self.target_token))
    }

    /// Rebuild the queued form of a bridge row (startup requeue, recovery).
    pub fn from_bridge(
        bridge: &db::BridgeTransaction,
        tokens: &crate::rules::TokenRegistry,
    ) -> Self {
        let source_decimals = tokens
            .by_chain_symbol(&bridge.source_chain, &bridge.source_symbol)
            .map(|t| t.decimals)
            .unwrap_or(18);
        let target_decimals = tokens
            .by_chain_symbol(&bridge.target_chain, &bridge.target_symbol)
            .map(|t| t.decimals)
            .unwrap_or(18);
        PayoutTask {
            source_id: bridge.source_id.clone(),
            source_chain: bridge.source_chain.clone(),
            source_symbol: bridge.source_symbol.clone(),
            source_amount: bridge.source_amount.clone(),
            source_decimals,
            target_chain: bridge.target_chain.clone(),
            target_token: bridge.target_token.clone(),
            target_symbol: bridge.target_symbol.clone(),
            target_address: bridge.target_address.clone(),
            target_amount: bridge.target_amount.clone(),
            target_decimals,
            is_native: is_native_asset(&bridge.target_token),
            response_makers: bridge.response_maker.clone(),
        }
    }
}

/// The zero address denotes the chain's native asset in the token registry.
pub fn is_native_asset(token: &str) -> bool {
    let t = token.trim().trim_start_matches("0x");
    !t.is_empty() && t.chars().all(|c| c == '0')
}

/// Persists the serial relation anchor. The account layer writes through
/// this immediately before committing a nonce and broadcasting.
#[async_trait]
pub trait SerialSink: Send + Sync {
    async fn save_serial_rel_tx_hash(
        &self,
        source_ids: &[String],
        tx_hash: &str,
        sender: &str,
    ) -> Result<()>;
}

/// Shared work-set state for matchers and sequencers.
pub struct Store {
    db: PgPool,
    inflight: Mutex<HashMap<QueueKey, HashMap<String, PayoutTask>>>,
    /// Source ids already reserved for (or recorded as) a broadcast
    serial_marks: Mutex<HashSet<String>>,
    sender_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Store {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            inflight: Mutex::new(HashMap::new()),
            serial_marks: Mutex::new(HashSet::new()),
            sender_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }

    // ============ In-flight set ============

    /// Queue a payout task. Idempotent per source id.
    pub fn add_transaction(&self, task: PayoutTask) {
        let key = task.queue_key();
        let mut inflight = self.inflight.lock().unwrap();
        inflight
            .entry(key)
            .or_default()
            .entry(task.source_id.clone())
            .or_insert(task);
    }

    pub fn get_transaction(&self, key: &QueueKey, source_id: &str) -> Option<PayoutTask> {
        self.inflight
            .lock()
            .unwrap()
            .get(key)
            .and_then(|m| m.get(source_id))
            .cloned()
    }

    pub fn remove_transaction(&self, key: &QueueKey, source_id: &str) -> Option<PayoutTask> {
        self.inflight
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|m| m.remove(source_id))
    }

    /// Snapshot of queue keys with pending work.
    pub fn pending_keys(&self) -> Vec<(QueueKey, usize)> {
        self.inflight
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(k, m)| (k.clone(), m.len()))
            .collect()
    }

    /// Clone all queued tasks for a key, oldest source id first.
    pub fn peek_all(&self, key: &QueueKey) -> Vec<PayoutTask> {
        let mut tasks: Vec<PayoutTask> = self
            .inflight
            .lock()
            .unwrap()
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        tasks.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        tasks
    }

    /// Detach tasks from the in-flight set AND reserve their source ids in
    /// the serial index, so a concurrent scheduler pass cannot pick them up
    /// again. Returns the detached tasks and a rollback handle.
    ///
    /// The rollback handle must only be invoked on a *before* error: once a
    /// broadcast may have landed, the reservation has to stand.
    pub fn remove_transactions_and_set_serial(
        self: Arc<Self>,
        key: &QueueKey,
        source_ids: &[String],
    ) -> (Vec<PayoutTask>, InflightRollback) {
        let mut detached = Vec::new();
        {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(queue) = inflight.get_mut(key) {
                for id in source_ids {
                    if let Some(task) = queue.remove(id) {
                        detached.push(task);
                    }
                }
            }
        }
        {
            let mut marks = self.serial_marks.lock().unwrap();
            for task in &detached {
                marks.insert(task.source_id.clone());
            }
        }
        debug!(
            chain = %key.0,
            token = %key.1,
            detached = detached.len(),
            "Detached payout tasks and reserved serials"
        );

        let rollback = InflightRollback {
            store: self,
            tasks: detached.clone(),
        };
        (detached, rollback)
    }

    // ============ Serial relations ============

    /// Whether this process holds a broadcast reservation (or record) for a
    /// deposit. Duplicate-skip only; the durable serial_relations row is the
    /// crash anchor and is consulted by the startup reconciler, not here;
    /// a rolled-back pre-broadcast attempt leaves a DB row behind and must
    /// still be retryable.
    pub async fn get_serial_record(&self, source_id: &str) -> Result<bool> {
        Ok(self.serial_marks.lock().unwrap().contains(source_id))
    }

    // ============ Per-sender exclusivity ============

    /// Run `f` while holding the sender's mutex. At most one payout per
    /// sender runs at a time; waiters queue FIFO per sender and senders are
    /// independent. The entry for a sender is created on first use and kept
    /// for the process lifetime (bounded by the maker set).
    pub async fn account_run_exclusive<F, Fut, T>(&self, sender: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = {
            let mut locks = self.sender_locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(normalize_address(sender))
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = lock.lock().await;
        f().await
    }
}

#[async_trait]
impl SerialSink for Store {
    /// Durable write of the broadcast anchor, plus the memory mark so
    /// `get_serial_record` answers without a round trip.
    async fn save_serial_rel_tx_hash(
        &self,
        source_ids: &[String],
        tx_hash: &str,
        sender: &str,
    ) -> Result<()> {
        db::insert_serial_relations(&self.db, source_ids, tx_hash, sender).await?;
        let mut marks = self.serial_marks.lock().unwrap();
        for id in source_ids {
            marks.insert(id.clone());
        }
        Ok(())
    }
}

/// Restores detached tasks to the in-flight set and releases their serial
/// reservations. Consumed on use; dropping it without calling keeps the
/// reservation (the safe default after a possible broadcast).
pub struct InflightRollback {
    store: Arc<Store>,
    tasks: Vec<PayoutTask>,
}

impl InflightRollback {
    pub fn rollback(self) {
        let mut marks = self.store.serial_marks.lock().unwrap();
        for task in &self.tasks {
            marks.remove(&task.source_id);
        }
        drop(marks);
        for task in self.tasks {
            self.store.add_transaction(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(source_id: &str) -> PayoutTask {
        PayoutTask {
            source_id: source_id.to_string(),
            source_chain: "1".to_string(),
            source_symbol: "ETH".to_string(),
            source_amount: "1000000000000009912".to_string(),
            source_decimals: 18,
            target_chain: "10".to_string(),
            target_token: "0x0000000000000000000000000000000000000000".to_string(),
            target_symbol: "ETH".to_string(),
            target_address: "0xuser".to_string(),
            target_amount: "996995015000000012".to_string(),
            target_decimals: 18,
            is_native: true,
            response_makers: vec!["0xmaker".to_string()],
        }
    }

    fn store() -> Arc<Store> {
        // The pool is lazy; no connection is made until a query runs, so the
        // in-memory paths are testable without Postgres.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        Arc::new(Store::new(pool))
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let store = store();
        let t = task("0xA");
        let key = t.queue_key();
        store.add_transaction(t);

        assert!(store.get_transaction(&key, "0xA").is_some());
        assert!(store.remove_transaction(&key, "0xA").is_some());
        assert!(store.get_transaction(&key, "0xA").is_none());
    }

    #[tokio::test]
    async fn test_add_is_idempotent_per_source_id() {
        let store = store();
        let key = task("0xA").queue_key();
        store.add_transaction(task("0xA"));
        store.add_transaction(task("0xA"));
        assert_eq!(store.peek_all(&key).len(), 1);
    }

    #[tokio::test]
    async fn test_detach_reserves_serial_and_rollback_restores() {
        let store = store();
        store.add_transaction(task("0xA"));
        store.add_transaction(task("0xB"));
        let key = task("0xA").queue_key();

        let (detached, rollback) = Arc::clone(&store)
            .remove_transactions_and_set_serial(&key, &["0xA".to_string(), "0xB".to_string()]);
        assert_eq!(detached.len(), 2);
        assert!(store.peek_all(&key).is_empty());
        assert!(store.get_serial_record("0xA").await.unwrap());

        rollback.rollback();
        assert_eq!(store.peek_all(&key).len(), 2);
        assert!(!store.get_serial_record("0xA").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropping_rollback_keeps_reservation() {
        let store = store();
        store.add_transaction(task("0xA"));
        let key = task("0xA").queue_key();

        let (_detached, rollback) =
            Arc::clone(&store).remove_transactions_and_set_serial(&key, &["0xA".to_string()]);
        drop(rollback);

        assert!(store.peek_all(&key).is_empty());
        assert!(store.get_serial_record("0xA").await.unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_serializes_same_sender() {
        let store = store();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                store
                    .account_run_exclusive("0xMaker", move || async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exclusive_is_independent_across_senders() {
        let store = store();
        let a = store.account_run_exclusive("0xA", || async { 1 });
        let b = store.account_run_exclusive("0xB", || async { 2 });
        let (a, b) = tokio::join!(a, b);
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn test_sender_key_is_case_insensitive() {
        let store = store();
        // Same underlying lock for both spellings: the second closure can
        // only observe the flag after the first released the mutex.
        let flag = Arc::new(AtomicUsize::new(0));
        let f1 = flag.clone();
        store
            .account_run_exclusive("0xMAKER", move || async move {
                f1.store(1, Ordering::SeqCst);
            })
            .await;
        let f2 = flag.clone();
        let saw = store
            .account_run_exclusive("0xmaker", move || async move { f2.load(Ordering::SeqCst) })
            .await;
        assert_eq!(saw, 1);
    }
}
