//! Leader election and key watching over a consistent key-value store.
//!
//! `ballot` layers two cooperating facilities on top of any store offering
//! compare-and-swap writes, TTL leases, and index-ordered change
//! notifications (the [`store::KeyValueStore`] binding):
//!
//! - **Voting** — [`Client::add_voter`] keeps claiming a key with this
//!   participant's value under a TTL lease and renews ahead of expiry.
//!   Whoever holds the key at any instant is the leader for that key.
//! - **Watching** — [`Client::add_watch`] streams the key's current value and
//!   every subsequent distinct value to a channel, recovering from transient
//!   store errors and history-window misses on its own.
//!
//! Consensus itself is the store's job; this crate only speaks the
//! claim / renew / observe protocol against it.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//!
//! use ballot::Client;
//! use ballot::ClientConfig;
//! use ballot::store::memory::MemoryKvStore;
//!
//! let client = Client::new(ClientConfig {
//!     store: Some(MemoryKvStore::new()),
//!     clock: None,
//! })?;
//!
//! // Participate in the election for "/leader" with a three second lease.
//! client.add_voter("/leader", "node-1", Duration::from_secs(3)).await?;
//!
//! // Observe whoever leads.
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//! client.add_watch("/leader", Duration::from_millis(500), tx);
//! while let Some(leader) = rx.recv().await {
//!     println!("leader is {leader}");
//! }
//! ```

#![warn(missing_docs)]

mod backoff;
mod client;
mod clock;
mod error;
pub mod store;
mod voter;
mod watch;

pub use client::Client;
pub use client::ClientConfig;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use error::ElectionError;
pub use error::Result;
