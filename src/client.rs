//! Client lifecycle and the public operation surface.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::error::ClosedSnafu;
use crate::error::InvalidConfigSnafu;
use crate::error::Result;
use crate::error::TermTooShortSnafu;
use crate::error::VoterMismatchSnafu;
use crate::error::VoterNotRunningSnafu;
use crate::store::KeyValueStore;
use crate::voter::Voter;
use crate::voter::VoterSpec;
use crate::watch::Watcher;
use crate::watch::spawn_callback_dispatcher;

/// Minimum allowed lease term.
const MIN_TERM: Duration = Duration::from_secs(1);

/// Configuration for [`Client`].
#[derive(Default)]
pub struct ClientConfig {
    /// Binding to the backing key-value store. Required.
    pub store: Option<Arc<dyn KeyValueStore>>,
    /// Time source for lease-health checks. Defaults to [`SystemClock`].
    pub clock: Option<Arc<dyn Clock>>,
}

/// Leader-election and key-watch client.
///
/// One client per process is typical. Cloning is cheap and every clone shares
/// the same voter, watches, and shutdown signal. When the last clone is
/// dropped the client shuts down as if [`Client::close`] had been called.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    voter_tx: mpsc::Sender<bool>,
    pause_tx: mpsc::Sender<()>,
    voter: Mutex<VoterSlot>,
}

/// One-shot start state for the voter loop.
struct VoterSlot {
    /// Receiver halves handed to the loop on first registration.
    channels: Option<(mpsc::Receiver<bool>, mpsc::Receiver<()>)>,
    /// Parameters the loop was started with.
    spec: Option<VoterSpec>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Reap background tasks once the last handle is gone.
        self.shutdown.cancel();
    }
}

impl Client {
    /// Create a client over the configured store binding.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let Some(store) = config.store else {
            return InvalidConfigSnafu {
                reason: "store binding is required",
            }
            .fail();
        };
        let clock = config.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (voter_tx, voter_rx) = mpsc::channel(1);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                clock,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                voter_tx,
                pause_tx,
                voter: Mutex::new(VoterSlot {
                    channels: Some((voter_rx, pause_rx)),
                    spec: None,
                }),
            }),
        })
    }

    /// Signal shutdown to every voter, watcher, and dispatcher task.
    ///
    /// Idempotent and non-blocking: the first call broadcasts the signal,
    /// later calls are no-ops. Tasks observe the signal at their next
    /// suspension point and issue no further store operations.
    pub fn close(&self) {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.shutdown.cancel();
        }
    }

    /// Watch `key`, sending its current value followed by every subsequent
    /// distinct value on `sink`.
    ///
    /// Returns immediately; the watch runs until the client shuts down or the
    /// receiving half of `sink` is dropped. A key that does not exist yet is
    /// not an error — the sink stays silent until it appears, polled every
    /// `retry`. Sends apply backpressure: a subscriber that stops draining
    /// stalls its watch, so drain promptly or give the channel capacity.
    pub fn add_watch(&self, key: impl Into<String>, retry: Duration, sink: mpsc::Sender<String>) {
        let watcher = Watcher::new(
            self.shared.store.clone(),
            self.shared.shutdown.clone(),
            key.into(),
            retry,
        );
        tokio::spawn(watcher.run(sink));
    }

    /// Invoke `callback(key, previous, new)` for the current value and every
    /// subsequent distinct value of `key`.
    ///
    /// On the first invocation both value arguments are the bootstrap value.
    /// The callback runs on its own task; a slow callback backpressures the
    /// underlying watch rather than dropping values.
    pub fn add_watch_callback<F>(&self, key: impl Into<String>, retry: Duration, callback: F)
    where
        F: Fn(&str, &str, &str) + Send + 'static,
    {
        let watcher = Watcher::new(
            self.shared.store.clone(),
            self.shared.shutdown.clone(),
            key.into(),
            retry,
        );
        spawn_callback_dispatcher(watcher, callback);
    }

    /// Enter the election for `key`, claiming it with `value` under a lease
    /// of `term` and renewing for as long as voting stays enabled.
    ///
    /// The first call starts the voter loop; this and every later call then
    /// enables voting, so the method is idempotent. Later calls must pass the
    /// same `key`, `value`, and `term`. Completes once the loop has accepted
    /// the enable signal; dropping the future before that abandons the
    /// operation without side effects.
    pub async fn add_voter(&self, key: impl Into<String>, value: impl Into<String>, term: Duration) -> Result<()> {
        let spec = VoterSpec {
            key: key.into(),
            value: value.into(),
            term,
        };
        if spec.term < MIN_TERM {
            return TermTooShortSnafu {
                term_ms: spec.term.as_millis() as u64,
            }
            .fail();
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return ClosedSnafu.fail();
        }

        {
            let mut slot = self.shared.voter.lock();
            if let Some(existing) = &slot.spec {
                if *existing != spec {
                    return VoterMismatchSnafu {
                        existing_key: existing.key.clone(),
                    }
                    .fail();
                }
            } else if let Some((control_rx, pause_rx)) = slot.channels.take() {
                slot.spec = Some(spec.clone());
                let voter = Voter::new(
                    self.shared.store.clone(),
                    self.shared.clock.clone(),
                    self.shared.shutdown.clone(),
                    spec,
                );
                tokio::spawn(voter.run(control_rx, pause_rx));
            }
        }

        self.send_control(true).await
    }

    /// Disable voting. The loop keeps running and can be re-enabled with
    /// [`Client::add_voter`]; a currently-held lease is left to lapse.
    pub async fn remove_voter(&self) -> Result<()> {
        self.ensure_voter_started()?;
        self.send_control(false).await
    }

    /// Give up leadership: the voter pauses for twice the term, long enough
    /// for its lease to lapse and another participant to win, then resumes
    /// voting on its own.
    pub async fn step_down(&self) -> Result<()> {
        self.ensure_voter_started()?;
        if self.shared.closed.load(Ordering::Acquire) {
            return ClosedSnafu.fail();
        }
        tokio::select! {
            sent = self.shared.pause_tx.send(()) => {
                if sent.is_err() {
                    return ClosedSnafu.fail();
                }
            }
            _ = self.shared.shutdown.cancelled() => return ClosedSnafu.fail(),
        }
        Ok(())
    }

    async fn send_control(&self, enabled: bool) -> Result<()> {
        tokio::select! {
            sent = self.shared.voter_tx.send(enabled) => {
                if sent.is_err() {
                    return ClosedSnafu.fail();
                }
            }
            _ = self.shared.shutdown.cancelled() => return ClosedSnafu.fail(),
        }
        Ok(())
    }

    fn ensure_voter_started(&self) -> Result<()> {
        if self.shared.voter.lock().spec.is_none() {
            return VoterNotRunningSnafu.fail();
        }
        Ok(())
    }
}
