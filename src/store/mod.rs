//! Key-value store binding.
//!
//! The election client talks to its backing store through the narrow
//! interface in this module: consistent reads, conditional TTL writes, and
//! index-anchored change subscriptions. Production bindings adapt a real
//! store behind [`KeyValueStore`]; [`memory::MemoryKvStore`] is a
//! deterministic in-process binding for tests, simulation, and embedding.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

/// Result type for store operations.
pub type KvResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a [`KeyValueStore`] binding.
///
/// The client classifies errors through the predicate methods rather than
/// matching variants directly, so bindings are free to map their transport's
/// failures onto the closest variant.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The key does not exist.
    #[snafu(display("key '{}' not found", key))]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A conditional write found state other than its condition.
    #[snafu(display("compare-and-swap failed for key '{}'", key))]
    CasFailed {
        /// The contended key.
        key: String,
    },

    /// The requested watch anchor fell out of the store's history window.
    #[snafu(display("watch history lost for key '{}': index {} is no longer retained", key, requested_index))]
    HistoryLost {
        /// The watched key.
        key: String,
        /// The anchor index that can no longer be replayed.
        requested_index: u64,
    },

    /// The operation was cancelled before completing.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// The store could not serve the request.
    #[snafu(display("store unavailable: {}", reason))]
    Unavailable {
        /// Human-readable failure description.
        reason: String,
    },
}

impl StoreError {
    /// True when the error means the key does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True when a conditional write lost to concurrent state.
    pub fn is_cas_failed(&self) -> bool {
        matches!(self, StoreError::CasFailed { .. })
    }

    /// True when a watch fell behind the store's retained history.
    pub fn is_history_lost(&self) -> bool {
        matches!(self, StoreError::HistoryLost { .. })
    }

    /// True when the error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

/// A stored key-value entry with its lease and revision metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvEntry {
    /// The key identifying this entry.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Store-wide index of the most recent modification to this key.
    ///
    /// Strictly increasing per key; used as the expected index in
    /// [`SetCondition::CurrentEntry`] renewals.
    pub modified_index: u64,
    /// When the entry's lease lapses, in Unix milliseconds. `None` for
    /// entries written without a TTL.
    pub expires_at_ms: Option<u64>,
}

impl KvEntry {
    /// Milliseconds until the lease lapses; zero when already expired or
    /// when the entry carries no lease.
    pub fn remaining_ttl_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms
            .map(|deadline| deadline.saturating_sub(now_ms))
            .unwrap_or(0)
    }
}

/// Response from a consistent read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetResponse {
    /// The entry read.
    pub entry: KvEntry,
    /// The store-wide change index at read time.
    ///
    /// This is the recommended anchor for (re-)opening a watch after a
    /// history miss: subscribe to changes strictly after it.
    pub store_index: u64,
}

/// Response from a conditional write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetResponse {
    /// The entry as written.
    pub entry: KvEntry,
    /// The store-wide change index after the write.
    pub store_index: u64,
}

/// Predicate a conditional write requires of the key's current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SetCondition {
    /// The key must not currently exist.
    AbsentKey,
    /// The key must currently hold `value` at `modified_index`.
    CurrentEntry {
        /// Expected current value.
        value: String,
        /// Expected current modification index.
        modified_index: u64,
    },
}

/// A conditional, lease-bound write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetRequest {
    /// The key to write.
    pub key: String,
    /// The value to store.
    pub value: String,
    /// Lease duration; the store deletes the key when it lapses.
    pub ttl: Duration,
    /// Predicate the current state must satisfy.
    pub condition: SetCondition,
}

impl SetRequest {
    /// Claim a key that must not currently exist.
    pub fn create(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
            condition: SetCondition::AbsentKey,
        }
    }

    /// Extend a lease this participant already holds: the store must still
    /// hold `value` at `modified_index`.
    pub fn renew(key: impl Into<String>, value: impl Into<String>, ttl: Duration, modified_index: u64) -> Self {
        let value = value.into();
        Self {
            key: key.into(),
            condition: SetCondition::CurrentEntry {
                value: value.clone(),
                modified_index,
            },
            value,
            ttl,
        }
    }
}

/// A change notification for a watched key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    /// The key that changed.
    pub key: String,
    /// The value after the change.
    ///
    /// Deletions and lease expirations surface as events with an
    /// **empty-string value** (the store's tombstone convention).
    pub value: String,
    /// The value before the change, when the store retains it.
    pub prev_value: Option<String>,
    /// Store-wide index of this change. Events on one subscription arrive
    /// in strictly increasing index order.
    pub modified_index: u64,
}

/// Consistent key-value store with CAS writes, TTL leases, and
/// index-ordered change notifications.
///
/// Implementations must be safe for concurrent use; one binding is shared by
/// every voter and watcher task of a client.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the current entry for `key`.
    async fn get(&self, key: &str) -> KvResult<GetResponse>;

    /// Apply a conditional, lease-bound write.
    ///
    /// Fails with a CAS error (see [`StoreError::is_cas_failed`]) when the
    /// request's condition does not hold.
    async fn set(&self, request: SetRequest) -> KvResult<SetResponse>;

    /// Open a change subscription for `key`, delivering events with a
    /// modification index strictly greater than `after_index`.
    async fn watch(&self, key: &str, after_index: u64) -> KvResult<Box<dyn Subscription>>;
}

/// An open change subscription returned by [`KeyValueStore::watch`].
#[async_trait]
pub trait Subscription: Send {
    /// Await the next change after the previously returned one.
    ///
    /// Must be cancel-safe: dropping the returned future abandons the wait
    /// without losing the event, so callers may race it against shutdown.
    async fn next(&mut self) -> KvResult<WatchEvent>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, key: &str) -> KvResult<GetResponse> {
        (**self).get(key).await
    }

    async fn set(&self, request: SetRequest) -> KvResult<SetResponse> {
        (**self).set(request).await
    }

    async fn watch(&self, key: &str, after_index: u64) -> KvResult<Box<dyn Subscription>> {
        (**self).watch(key, after_index).await
    }
}
