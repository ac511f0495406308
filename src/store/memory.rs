//! Deterministic in-memory store binding.
//!
//! Mirrors the contract of a consensus-backed store without network or disk
//! I/O: TTL expiry, a store-wide write index, and a bounded change-history
//! window for subscriptions. Used by unit tests, simulation tests, and
//! embedders that want the election client against local state.
//!
//! Expired entries are swept lazily on every operation, so expiry becomes
//! observable (including its tombstone event) the next time anything touches
//! the store.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::store::GetResponse;
use crate::store::KeyValueStore;
use crate::store::KvEntry;
use crate::store::KvResult;
use crate::store::SetCondition;
use crate::store::SetRequest;
use crate::store::SetResponse;
use crate::store::StoreError;
use crate::store::Subscription;
use crate::store::WatchEvent;

/// Change records retained for watch replay before the window rolls over.
const DEFAULT_HISTORY_CAPACITY: usize = 1000;

struct StoredEntry {
    value: String,
    modified_index: u64,
    expires_at_ms: Option<u64>,
}

struct State {
    entries: HashMap<String, StoredEntry>,
    history: VecDeque<WatchEvent>,
    history_capacity: usize,
    store_index: u64,
    /// Highest index evicted from `history`. Subscriptions anchored below it
    /// have lost events.
    evicted_through: u64,
}

impl State {
    /// Remove lapsed entries, recording a tombstone event per key.
    /// Returns true when anything expired.
    fn sweep_expired(&mut self, now_ms: u64) -> bool {
        let lapsed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at_ms.is_some_and(|deadline| deadline <= now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        let swept = !lapsed.is_empty();
        for key in lapsed {
            let previous = self.entries.remove(&key);
            self.record(key, String::new(), previous.map(|entry| entry.value));
        }
        swept
    }

    /// Append a change record, rolling the history window forward.
    fn record(&mut self, key: String, value: String, prev_value: Option<String>) -> u64 {
        self.store_index += 1;
        self.history.push_back(WatchEvent {
            key,
            value,
            prev_value,
            modified_index: self.store_index,
        });
        if self.history.len() > self.history_capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.evicted_through = evicted.modified_index;
            }
        }
        self.store_index
    }

    fn apply_put(&mut self, key: &str, value: &str, expires_at_ms: Option<u64>) -> KvEntry {
        let prev_value = self.entries.get(key).map(|entry| entry.value.clone());
        let index = self.record(key.to_string(), value.to_string(), prev_value);
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: value.to_string(),
                modified_index: index,
                expires_at_ms,
            },
        );
        KvEntry {
            key: key.to_string(),
            value: value.to_string(),
            modified_index: index,
            expires_at_ms,
        }
    }
}

/// In-memory implementation of [`KeyValueStore`].
///
/// Beyond the binding trait it offers unconditional [`put`](Self::put) and
/// [`delete`](Self::delete) so tests and embedders can mutate keys the way an
/// external writer would.
pub struct MemoryKvStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    index_tx: Arc<watch::Sender<u64>>,
}

impl MemoryKvStore {
    /// Create a store on the system clock.
    pub fn new() -> Arc<Self> {
        Self::build(Arc::new(SystemClock), DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a store whose TTL expiry follows the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::build(clock, DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a store retaining at most `capacity` change records, after
    /// which lagging subscriptions observe history loss.
    pub fn with_history_capacity(capacity: usize) -> Arc<Self> {
        Self::build(Arc::new(SystemClock), capacity)
    }

    fn build(clock: Arc<dyn Clock>, history_capacity: usize) -> Arc<Self> {
        let (index_tx, _) = watch::channel(0);
        Arc::new(Self {
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                history: VecDeque::new(),
                history_capacity,
                store_index: 0,
                evicted_through: 0,
            })),
            clock,
            index_tx: Arc::new(index_tx),
        })
    }

    /// Unconditionally set a key with no TTL, as an external writer would.
    /// Returns the modification index of the write.
    pub async fn put(&self, key: &str, value: &str) -> u64 {
        let now_ms = self.clock.now_unix_ms();
        let mut state = self.state.lock().await;
        state.sweep_expired(now_ms);
        let entry = state.apply_put(key, value, None);
        self.index_tx.send_replace(state.store_index);
        entry.modified_index
    }

    /// Remove a key, recording a tombstone event. No-op when absent.
    pub async fn delete(&self, key: &str) {
        let now_ms = self.clock.now_unix_ms();
        let mut state = self.state.lock().await;
        state.sweep_expired(now_ms);
        if let Some(previous) = state.entries.remove(key) {
            state.record(key.to_string(), String::new(), Some(previous.value));
        }
        self.index_tx.send_replace(state.store_index);
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<GetResponse> {
        let now_ms = self.clock.now_unix_ms();
        let mut state = self.state.lock().await;
        if state.sweep_expired(now_ms) {
            self.index_tx.send_replace(state.store_index);
        }
        let entry = state.entries.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok(GetResponse {
            entry: KvEntry {
                key: key.to_string(),
                value: entry.value.clone(),
                modified_index: entry.modified_index,
                expires_at_ms: entry.expires_at_ms,
            },
            store_index: state.store_index,
        })
    }

    async fn set(&self, request: SetRequest) -> KvResult<SetResponse> {
        let now_ms = self.clock.now_unix_ms();
        let mut state = self.state.lock().await;
        state.sweep_expired(now_ms);
        let current = state.entries.get(&request.key);
        let condition_holds = match (&request.condition, current) {
            (SetCondition::AbsentKey, None) => true,
            (SetCondition::AbsentKey, Some(_)) => false,
            (
                SetCondition::CurrentEntry {
                    value,
                    modified_index,
                },
                Some(existing),
            ) => existing.value == *value && existing.modified_index == *modified_index,
            (SetCondition::CurrentEntry { .. }, None) => false,
        };
        if !condition_holds {
            self.index_tx.send_replace(state.store_index);
            return Err(StoreError::CasFailed { key: request.key });
        }
        let ttl_ms = request.ttl.as_millis() as u64;
        let entry = state.apply_put(&request.key, &request.value, Some(now_ms + ttl_ms));
        let store_index = state.store_index;
        self.index_tx.send_replace(store_index);
        Ok(SetResponse { entry, store_index })
    }

    async fn watch(&self, key: &str, after_index: u64) -> KvResult<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            state: self.state.clone(),
            clock: self.clock.clone(),
            index_tx: self.index_tx.clone(),
            index_rx: self.index_tx.subscribe(),
            key: key.to_string(),
            cursor: after_index,
        }))
    }
}

struct MemorySubscription {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    index_tx: Arc<watch::Sender<u64>>,
    index_rx: watch::Receiver<u64>,
    key: String,
    cursor: u64,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> KvResult<WatchEvent> {
        loop {
            let observed_index = {
                let mut state = self.state.lock().await;
                if state.sweep_expired(self.clock.now_unix_ms()) {
                    self.index_tx.send_replace(state.store_index);
                }
                if self.cursor < state.evicted_through {
                    return Err(StoreError::HistoryLost {
                        key: self.key.clone(),
                        requested_index: self.cursor,
                    });
                }
                if let Some(event) = state
                    .history
                    .iter()
                    .find(|event| event.key == self.key && event.modified_index > self.cursor)
                {
                    self.cursor = event.modified_index;
                    return Ok(event.clone());
                }
                state.store_index
            };
            if self
                .index_rx
                .wait_for(|index| *index > observed_index)
                .await
                .is_err()
            {
                return Err(StoreError::Cancelled);
            }
        }
    }
}
