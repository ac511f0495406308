//! Election voter: claims and renews a leadership key under a TTL lease.

use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::clock::Clock;
use crate::error::ElectionError;
use crate::error::StoreSnafu;
use crate::store::KeyValueStore;
use crate::store::SetRequest;

/// One election participant: the key to claim, the value to claim it with,
/// and the lease term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VoterSpec {
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) term: Duration,
}

pub(crate) struct Voter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    spec: VoterSpec,
}

impl Voter {
    pub(crate) fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
        spec: VoterSpec,
    ) -> Self {
        Self {
            store,
            clock,
            shutdown,
            spec,
        }
    }

    /// Voter loop.
    ///
    /// One election attempt runs up front so a fresh voter does not wait a
    /// full tick. Afterwards attempts are paced by a ticker at term/5, armed
    /// and disarmed through the control channel, interrupted by step-down,
    /// and ended by shutdown.
    pub(crate) async fn run(self, mut control_rx: mpsc::Receiver<bool>, mut pause_rx: mpsc::Receiver<()>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Err(error) = self.elect().await {
            warn!(key = %self.spec.key, error = %error, "voter attempt failed");
        }
        let mut ticker = Some(self.new_ticker());
        loop {
            tokio::select! {
                _ = Self::tick(&mut ticker), if ticker.is_some() => {
                    if let Err(error) = self.elect().await {
                        warn!(key = %self.spec.key, error = %error, "voter attempt failed");
                    }
                }
                command = control_rx.recv() => match command {
                    Some(true) => {
                        if ticker.is_none() {
                            ticker = Some(self.new_ticker());
                        }
                    }
                    Some(false) => ticker = None,
                    None => return,
                },
                paused = pause_rx.recv() => {
                    if paused.is_none() {
                        return;
                    }
                    info!(key = %self.spec.key, "stepping down");
                    // Twice the term: long enough for a held lease to lapse,
                    // so another participant can actually take over.
                    tokio::select! {
                        _ = tokio::time::sleep(self.spec.term * 2) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    fn new_ticker(&self) -> Interval {
        let period = self.spec.term / 5;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    async fn tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            // Branch is disabled by its precondition when the ticker is off.
            None => std::future::pending().await,
        }
    }

    /// One round of the election protocol.
    pub(crate) async fn elect(&self) -> Result<(), ElectionError> {
        let response = match self.store.get(&self.spec.key).await {
            Ok(response) => response,
            Err(error) if error.is_not_found() => {
                // Key is free: try to claim it for the term.
                let claim = SetRequest::create(&self.spec.key, &self.spec.value, self.spec.term);
                return match self.store.set(claim).await {
                    Ok(_) => {
                        debug!(key = %self.spec.key, value = %self.spec.value, "elected");
                        Ok(())
                    }
                    // Another participant won this round.
                    Err(error) if error.is_cas_failed() => Ok(()),
                    Err(error) => Err(error).context(StoreSnafu),
                };
            }
            Err(error) => return Err(error).context(StoreSnafu),
        };

        if response.entry.value != self.spec.value {
            // Another participant holds the key.
            return Ok(());
        }

        let remaining_ms = response.entry.remaining_ttl_ms(self.clock.now_unix_ms());
        if remaining_ms > self.spec.term.as_millis() as u64 / 2 {
            // Lease is still healthy; no write needed.
            return Ok(());
        }

        let renew = SetRequest::renew(
            &self.spec.key,
            &self.spec.value,
            self.spec.term,
            response.entry.modified_index,
        );
        self.store.set(renew).await.context(StoreSnafu)?;
        debug!(key = %self.spec.key, value = %self.spec.value, "lease extended");
        Ok(())
    }
}
