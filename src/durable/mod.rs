//! Durable-object transactional store.
//!
//! Provides `get`/`put`/`delete`/`delete_all`/`list` with multi-key
//! serializable semantics over any storage backend, using optimistic
//! concurrency control: transactions read freely against a snapshot
//! version, buffer writes in shadow copies, and validate their read set
//! against the write sets of transactions that committed since they began.
//! A failed validation replays the closure; retries are unbounded, so a
//! transaction that observes no concurrent writes to its read set is
//! guaranteed to commit.
//!
//! Commit runs under a per-store mutex: validate, apply the shadow copies
//! to the substrate, bump the committed-transaction counter, and record the
//! write set in a small ring for later validators.
//!
//! # Examples
//!
//! ```rust
//! use kumo::durable::DurableObjectStore;
//! use kumo::storage::MemoryStorage;
//! use kumo::clock::system_clock;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # async fn example() -> kumo::error::Result<()> {
//! let store = DurableObjectStore::new(Arc::new(MemoryStorage::new(system_clock())));
//! let value = store
//!     .transaction(|txn| async move {
//!         txn.put("counter", Bytes::from("1")).await?;
//!         txn.get("counter").await
//!     })
//!     .await?;
//! assert_eq!(value, Some(Bytes::from("1")));
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    error::{KumoError, Result},
    gate::RequestContext,
    storage::{ListOptions, Listing, Storage, StoredEntry},
};

mod alarm;

pub use alarm::{AlarmHandle, AlarmHandler, AlarmScheduler};

/// Reserved key holding the object's pending alarm time.
const ALARM_KEY: &str = "__alarm__";

/// Number of committed write sets retained for validation.
const COMMIT_RING_SIZE: usize = 16;

struct CommitLog {
    txn_count: u64,
    // Pairs of (committed txn number, write set), oldest first.
    ring: VecDeque<(u64, HashSet<String>)>,
}

/// Multi-key serializable store for one durable object.
pub struct DurableObjectStore {
    storage: Arc<dyn Storage>,
    log: Mutex<CommitLog>,
    commit_mutex: tokio::sync::Mutex<()>,
    alarm_notify: Arc<Notify>,
}

#[derive(Default)]
struct TxnState {
    read_set: HashSet<String>,
    // Shadow writes: `None` marks a tombstone.
    copies: HashMap<String, Option<Bytes>>,
    // Staged alarm write: `Some(None)` deletes the alarm on commit.
    alarm: Option<Option<u64>>,
    rolled_back: bool,
}

/// Handle to an in-flight transaction; cheap to clone into the closure.
#[derive(Clone)]
pub struct Transaction {
    storage: Arc<dyn Storage>,
    start_version: u64,
    state: Arc<Mutex<TxnState>>,
}

impl DurableObjectStore {
    /// Creates a store over the given substrate backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            log: Mutex::new(CommitLog {
                txn_count: 0,
                ring: VecDeque::new(),
            }),
            commit_mutex: tokio::sync::Mutex::new(()),
            alarm_notify: Arc::new(Notify::new()),
        }
    }

    /// Runs `closure` inside an OCC transaction, replaying it until commit
    /// validation succeeds. Retries are unbounded by design.
    pub async fn transaction<F, Fut, T>(&self, closure: F) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.transaction_inner(None, closure).await
    }

    /// Like [`Self::transaction`], holding the context's gates closed while
    /// the commit's writes are in flight so no event dispatch or outbound
    /// effect observes a half-applied state.
    pub async fn transaction_in_context<F, Fut, T>(
        &self,
        ctx: &RequestContext,
        closure: F,
    ) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.transaction_inner(Some(ctx), closure).await
    }

    async fn transaction_inner<F, Fut, T>(
        &self,
        ctx: Option<&RequestContext>,
        closure: F,
    ) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let txn = self.begin();
            let out = closure(txn.clone()).await?;
            if self.commit(&txn, ctx).await? {
                return Ok(out);
            }
        }
    }

    fn begin(&self) -> Transaction {
        Transaction {
            storage: self.storage.clone(),
            start_version: self.log.lock().txn_count,
            state: Arc::new(Mutex::new(TxnState::default())),
        }
    }

    /// Validates and applies a transaction. Returns false when validation
    /// failed and the closure must be replayed.
    async fn commit(&self, txn: &Transaction, ctx: Option<&RequestContext>) -> Result<bool> {
        let _commit = self.commit_mutex.lock().await;

        let (read_set, copies, alarm, rolled_back) = {
            let state = txn.state.lock();
            (
                state.read_set.clone(),
                state.copies.clone(),
                state.alarm,
                state.rolled_back,
            )
        };

        // A rolled-back transaction succeeds without writing.
        if rolled_back {
            return Ok(true);
        }

        {
            let log = self.log.lock();
            let oldest_known = log.ring.front().map(|(n, _)| *n).unwrap_or(log.txn_count + 1);
            for committed in (txn.start_version + 1)..=log.txn_count {
                if committed < oldest_known {
                    // The ring no longer covers this transaction; the
                    // conservative answer is to replay.
                    return Ok(false);
                }
                if let Some((_, writes)) = log.ring.iter().find(|(n, _)| *n == committed) {
                    if writes.iter().any(|k| read_set.contains(k)) {
                        return Ok(false);
                    }
                }
            }
        }

        // Hold both gates closed while writes are in flight: the worker
        // must not observe events or emit effects against half-applied
        // state.
        let _gates = ctx.map(|c| (c.input_gate.lock(), c.output_gate.lock()));

        let mut write_set: HashSet<String> = copies.keys().cloned().collect();
        for (key, value) in copies {
            match value {
                Some(bytes) => {
                    self.storage
                        .put(&key, StoredEntry::from_value(bytes))
                        .await?;
                }
                None => {
                    self.storage.delete(&key).await?;
                }
            }
        }
        if let Some(staged) = alarm {
            write_set.insert(ALARM_KEY.to_string());
            match staged {
                Some(at) => {
                    self.storage
                        .put(
                            ALARM_KEY,
                            StoredEntry::from_value(Bytes::from(at.to_string())),
                        )
                        .await?;
                }
                None => {
                    self.storage.delete(ALARM_KEY).await?;
                }
            }
            self.alarm_notify.notify_waiters();
        }

        let mut log = self.log.lock();
        log.txn_count += 1;
        let txn_count = log.txn_count;
        log.ring.push_back((txn_count, write_set));
        while log.ring.len() > COMMIT_RING_SIZE {
            log.ring.pop_front();
        }
        Ok(true)
    }

    /// One-shot read outside any explicit transaction.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let key = key.to_string();
        self.transaction(move |txn| {
            let key = key.clone();
            async move { txn.get(&key).await }
        })
        .await
    }

    /// One-shot write outside any explicit transaction.
    pub async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let key = key.to_string();
        self.transaction(move |txn| {
            let key = key.clone();
            let value = value.clone();
            async move { txn.put(&key, value).await }
        })
        .await
    }

    /// One-shot delete outside any explicit transaction.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.transaction(move |txn| {
            let key = key.clone();
            async move { txn.delete(&key).await }
        })
        .await
    }

    /// One-shot list outside any explicit transaction.
    pub async fn list(&self, options: ListOptions) -> Result<Listing> {
        self.transaction(move |txn| {
            let options = options.clone();
            async move { txn.list(options).await }
        })
        .await
    }

    /// Removes every user key, leaving the alarm record in place.
    pub async fn delete_all(&self) -> Result<()> {
        self.transaction(|txn| async move { txn.delete_all().await })
            .await
    }

    /// The pending alarm time in unix milliseconds, if any.
    pub async fn get_alarm(&self) -> Result<Option<u64>> {
        let entry = self.storage.get(ALARM_KEY, true).await?;
        Ok(entry.and_then(|e| std::str::from_utf8(&e.value).ok()?.parse().ok()))
    }

    /// Sets or clears the pending alarm immediately (outside a
    /// transaction).
    pub async fn set_alarm(&self, at_millis: Option<u64>) -> Result<()> {
        self.transaction(move |txn| async move {
            txn.set_alarm(at_millis);
            Ok(())
        })
        .await
    }

    pub(crate) fn alarm_notify(&self) -> Arc<Notify> {
        self.alarm_notify.clone()
    }
}

impl Transaction {
    fn check_active(&self) -> Result<()> {
        if self.state.lock().rolled_back {
            Err(KumoError::programming(
                "Cannot perform operations on a rolled back transaction",
            ))
        } else {
            Ok(())
        }
    }

    /// Reads a key, preferring this transaction's own shadow writes.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_active()?;
        {
            let mut state = self.state.lock();
            state.read_set.insert(key.to_string());
            if let Some(copy) = state.copies.get(key) {
                return Ok(copy.clone());
            }
        }
        Ok(self.storage.get(key, true).await?.map(|e| e.value))
    }

    /// Reads several keys with the same semantics as iterated gets.
    pub async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Buffers a write; visible to later reads in this transaction and
    /// applied to the substrate on commit.
    pub async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.check_active()?;
        crate::storage::validate_key(key)?;
        self.state
            .lock()
            .copies
            .insert(key.to_string(), Some(value));
        Ok(())
    }

    /// Buffers a delete. Returns whether the key currently exists; the
    /// existence probe joins the read set, since delete counts require
    /// pre-existence detection.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.check_active()?;
        let prior = {
            let mut state = self.state.lock();
            state.read_set.insert(key.to_string());
            state.copies.get(key).map(|c| c.is_some())
        };
        let existed = match prior {
            Some(existed) => existed,
            None => self.storage.has(key).await?,
        };
        self.state.lock().copies.insert(key.to_string(), None);
        Ok(existed)
    }

    /// Tombstones every user key currently in the substrate plus any key
    /// written earlier in this transaction.
    pub async fn delete_all(&self) -> Result<()> {
        self.check_active()?;
        let listing = self.storage.list(ListOptions::default(), true).await?;
        let mut state = self.state.lock();
        for key in listing.keys {
            if key.name == ALARM_KEY {
                continue;
            }
            state.read_set.insert(key.name.clone());
            state.copies.insert(key.name, None);
        }
        let staged: Vec<String> = state.copies.keys().cloned().collect();
        for key in staged {
            state.copies.insert(key, None);
        }
        Ok(())
    }

    /// Lists keys from the substrate. The matched keys join the read set,
    /// which is coarse but correct.
    pub async fn list(&self, options: ListOptions) -> Result<Listing> {
        self.check_active()?;
        let mut listing = self.storage.list(options, false).await?;
        listing.keys.retain(|k| k.name != ALARM_KEY);
        let mut state = self.state.lock();
        for key in &listing.keys {
            state.read_set.insert(key.name.clone());
        }
        Ok(listing)
    }

    /// Stages an alarm write, applied only on commit.
    pub fn set_alarm(&self, at_millis: Option<u64>) {
        self.state.lock().alarm = Some(at_millis);
    }

    /// Marks the transaction rolled back: the commit becomes a no-op and
    /// any further operation fails. Rolling back twice is permitted.
    pub fn rollback(&self) {
        self.state.lock().rolled_back = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{clock::system_clock, storage::MemoryStorage};

    fn store() -> DurableObjectStore {
        DurableObjectStore::new(Arc::new(MemoryStorage::new(system_clock())))
    }

    fn int(bytes: &Option<Bytes>) -> i64 {
        std::str::from_utf8(bytes.as_ref().unwrap())
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn reads_see_own_writes() {
        let store = store();
        store
            .transaction(|txn| async move {
                txn.put("a", Bytes::from("1")).await?;
                assert_eq!(txn.get("a").await?, Some(Bytes::from("1")));
                assert!(txn.delete("a").await?);
                assert_eq!(txn.get("a").await?, None);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = store();
        store.put("a", Bytes::from("1")).await.unwrap();
        store
            .transaction(|txn| async move {
                txn.put("a", Bytes::from("2")).await?;
                txn.rollback();
                // Idempotent: a second rollback is fine.
                txn.rollback();
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn operations_after_rollback_fail() {
        let store = store();
        store
            .transaction(|txn| async move {
                txn.rollback();
                assert!(txn.get("a").await.is_err());
                assert!(txn.put("a", Bytes::from("1")).await.is_err());
                assert!(txn.delete("a").await.is_err());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_increments_both_commit() {
        let store = Arc::new(store());
        store.put("a", Bytes::from("1")).await.unwrap();
        store.put("b", Bytes::from("2")).await.unwrap();

        let t1 = {
            let store = store.clone();
            async move {
                store
                    .transaction(|txn| async move {
                        let a = int(&txn.get("a").await?);
                        tokio::task::yield_now().await;
                        txn.put("a", Bytes::from((a + 1).to_string())).await
                    })
                    .await
            }
        };
        let t2 = {
            let store = store.clone();
            async move {
                store
                    .transaction(|txn| async move {
                        let a = int(&txn.get("a").await?);
                        tokio::task::yield_now().await;
                        txn.put("a", Bytes::from((a + 1).to_string())).await?;
                        let b = int(&txn.get("b").await?);
                        txn.put("b", Bytes::from((b + 1).to_string())).await
                    })
                    .await
            }
        };

        let (r1, r2) = tokio::join!(t1, t2);
        r1.unwrap();
        r2.unwrap();

        assert_eq!(int(&store.get("a").await.unwrap()), 3);
        assert_eq!(int(&store.get("b").await.unwrap()), 3);
    }

    #[tokio::test]
    async fn delete_reports_pre_existence() {
        let store = store();
        store.put("a", Bytes::from("1")).await.unwrap();
        let (was_a, was_b) = store
            .transaction(|txn| async move {
                Ok((txn.delete("a").await?, txn.delete("b").await?))
            })
            .await
            .unwrap();
        assert!(was_a);
        assert!(!was_b);
    }

    #[tokio::test]
    async fn delete_all_leaves_alarm() {
        let store = store();
        store.put("a", Bytes::from("1")).await.unwrap();
        store.put("b", Bytes::from("2")).await.unwrap();
        store.set_alarm(Some(12345)).await.unwrap();

        store.delete_all().await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(store.get_alarm().await.unwrap(), Some(12345));

        let listing = store.list(ListOptions::default()).await.unwrap();
        assert!(listing.keys.is_empty());
    }

    #[tokio::test]
    async fn alarm_only_takes_effect_on_commit() {
        let store = store();
        store
            .transaction(|txn| async move {
                txn.set_alarm(Some(99));
                txn.rollback();
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.get_alarm().await.unwrap(), None);

        store
            .transaction(|txn| async move {
                txn.set_alarm(Some(42));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.get_alarm().await.unwrap(), Some(42));
    }
}
