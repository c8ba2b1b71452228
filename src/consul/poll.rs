use std::time::Duration;

use tracing::debug;
use tracing::warn;

use super::api::KvApi;
use super::api::QueryOptions;
use crate::backend::WatchSender;
use crate::Error;
use crate::WATCH_ERRORS_METRIC;
use crate::WATCH_EVENTS_METRIC;

pub(crate) const POLL_STRATEGY: &str = "poll";

/// Wait-index long-poll of a single key.
///
/// Every failed read, including a missing key, is forwarded to the consumer
/// and followed by `error_delay`.
pub(crate) struct IndexPoller {
    key: String,
    query: QueryOptions,
    error_delay: Duration,
}

impl IndexPoller {
    pub(crate) fn new(
        key: impl Into<String>,
        query: QueryOptions,
        error_delay: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            query,
            error_delay,
        }
    }

    pub(crate) async fn run<A: KvApi + ?Sized>(
        &self,
        api: &A,
        sender: &WatchSender,
    ) {
        let mut opts = self.query.clone();
        opts.wait_index = 0;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = sender.closed() => break,
                fetched = api.get(&self.key, &opts) => fetched,
            };

            let failure = match fetched {
                Ok((Some(entry), meta)) => {
                    if meta.last_index == opts.wait_index {
                        continue;
                    }
                    opts.wait_index = meta.last_index;
                    WATCH_EVENTS_METRIC.with_label_values(&[POLL_STRATEGY]).inc();
                    if !sender.send(Ok(Some(entry.value.unwrap_or_default()))).await {
                        break;
                    }
                    continue;
                }
                Ok((None, _)) => Error::not_found(self.key.as_str()),
                Err(e) => e,
            };

            WATCH_ERRORS_METRIC.with_label_values(&[POLL_STRATEGY]).inc();
            warn!(target: "consul_watch", key = %self.key, error = %failure, delay = ?self.error_delay, "poll failed");
            if !sender.send(Err(failure)).await {
                break;
            }
            tokio::select! {
                _ = sender.closed() => break,
                _ = tokio::time::sleep(self.error_delay) => {}
            }
        }

        debug!(target: "consul_watch", key = %self.key, "index poller stopped");
    }
}
