//! Key watcher: streams distinct values of a key to subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::backoff::ExponentialBackoff;
use crate::store::GetResponse;
use crate::store::KeyValueStore;
use crate::store::Subscription;

/// Consecutive unclassified watch errors tolerated before a full re-arm.
const MAX_WATCH_ERRORS: u32 = 10;

/// A single registered watch: bootstraps the key's current value, then
/// follows the store's change feed for it.
pub(crate) struct Watcher {
    store: Arc<dyn KeyValueStore>,
    shutdown: CancellationToken,
    key: String,
    retry: Duration,
}

impl Watcher {
    pub(crate) fn new(
        store: Arc<dyn KeyValueStore>,
        shutdown: CancellationToken,
        key: String,
        retry: Duration,
    ) -> Self {
        Self {
            store,
            shutdown,
            key,
            retry,
        }
    }

    /// Watch loop: deliver the key's current value, then every distinct
    /// subsequent value, until shutdown or until the subscriber goes away.
    pub(crate) async fn run(self, sink: mpsc::Sender<String>) {
        let mut backoff = ExponentialBackoff::default();
        let mut subscription: Option<Box<dyn Subscription>> = None;
        let mut last_sent: Option<String> = None;
        let mut sent_any = false;
        let mut errors: u32 = 0;

        loop {
            if subscription.is_none() {
                let Some((fresh, response)) = self.arm().await else {
                    return;
                };
                // Deliver the bootstrap value unless the subscriber already
                // has it from before the re-arm.
                if last_sent.as_deref() != Some(response.entry.value.as_str()) {
                    if !self.deliver(&sink, response.entry.value.clone()).await {
                        return;
                    }
                    last_sent = Some(response.entry.value);
                    sent_any = true;
                }
                subscription = Some(fresh);
            }
            let active = match subscription.as_mut() {
                Some(active) => active,
                None => continue,
            };

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = active.next() => result,
            };

            match result {
                Ok(event) => {
                    if event.value.is_empty() {
                        // Tombstone from a delete or lease expiry.
                        continue;
                    }
                    backoff.reset();
                    errors = 0;
                    if sent_any && last_sent.as_deref() == Some(event.value.as_str()) {
                        // Idempotent write: the subscriber already has this value.
                        continue;
                    }
                    if !self.deliver(&sink, event.value.clone()).await {
                        return;
                    }
                    last_sent = Some(event.value);
                    sent_any = true;
                }
                Err(error) if error.is_cancelled() => return,
                Err(error) if error.is_history_lost() => {
                    debug!(key = %self.key, "watch history lost, re-arming");
                    subscription = None;
                }
                Err(error) => {
                    warn!(key = %self.key, error = %error, "unexpected watch error");
                    errors += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.next_delay()) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                    if errors > MAX_WATCH_ERRORS {
                        subscription = None;
                        backoff.reset();
                        errors = 0;
                    }
                }
            }
        }
    }

    /// Bootstrap the key's current value and open a change subscription
    /// anchored at the read's store-wide index. Returns `None` only when
    /// shutdown fires.
    async fn arm(&self) -> Option<(Box<dyn Subscription>, GetResponse)> {
        loop {
            let response = self.first_value().await?;
            match self.store.watch(&self.key, response.store_index).await {
                Ok(subscription) => {
                    debug!(
                        key = %self.key,
                        value = %response.entry.value,
                        after_index = response.store_index,
                        "watch armed"
                    );
                    return Some((subscription, response));
                }
                Err(error) => {
                    debug!(key = %self.key, error = %error, "failed to open watch, retrying");
                    self.wait_retry().await;
                }
            }
        }
    }

    /// Poll the key until it exists. A missing key is not an error; any other
    /// read failure is logged and retried. Returns `None` on shutdown.
    async fn first_value(&self) -> Option<GetResponse> {
        loop {
            if self.shutdown.is_cancelled() {
                debug!(key = %self.key, "shutdown during bootstrap");
                return None;
            }
            match self.store.get(&self.key).await {
                Ok(response) => return Some(response),
                Err(error) if error.is_not_found() => {}
                Err(error) => debug!(key = %self.key, error = %error, "bootstrap read failed"),
            }
            self.wait_retry().await;
        }
    }

    /// Sleep one retry period, or less if shutdown fires first; callers
    /// re-check the shutdown signal on their next iteration.
    async fn wait_retry(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.retry) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Send a value to the sink, selectable against shutdown. Returns false
    /// when the watch should end: shutdown fired or the subscriber dropped
    /// its receiver.
    async fn deliver(&self, sink: &mpsc::Sender<String>, value: String) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = sink.send(value) => sent.is_ok(),
        }
    }
}

/// Spawn the dispatcher that turns a watch stream into callback invocations.
///
/// The callback is invoked as `(key, previous, new)`; on the first invocation
/// both value arguments are the bootstrap value.
pub(crate) fn spawn_callback_dispatcher<F>(watcher: Watcher, callback: F)
where
    F: Fn(&str, &str, &str) + Send + 'static,
{
    let shutdown = watcher.shutdown.clone();
    let key = watcher.key.clone();
    tokio::spawn(async move {
        let (values_tx, mut values_rx) = mpsc::channel(1);
        tokio::spawn(watcher.run(values_tx));
        let mut previous: Option<String> = None;
        loop {
            let value = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = values_rx.recv() => match received {
                    Some(value) => value,
                    None => return,
                },
            };
            let prior = previous.take().unwrap_or_else(|| value.clone());
            callback(&key, &prior, &value);
            previous = Some(value);
        }
    });
}
