//! Watch plans over Consul blocking queries.
//!
//! A [`WatchPlan`] is built from loosely-typed parameters, the way Consul
//! watches are declared in agent configuration:
//!
//! ```json
//! { "type": "key", "key": "app/port", "datacenter": "dc1", "stale": true }
//! ```
//!
//! [`WatchPlan::run`] then long-polls the agent and calls a handler each time
//! the watched data actually changes.

use std::future::Future;
use std::time::Duration;

use serde_json::Map;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;

use super::api::KvApi;
use super::api::KvEntry;
use super::api::QueryOptions;
use crate::Result;
use crate::WatchPlanError;
use crate::WATCH_ERRORS_METRIC;
use crate::WATCH_EVENTS_METRIC;

pub(crate) const PLAN_STRATEGY: &str = "plan";

/// Base delay between failed queries
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound of the delay between failed queries
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(20);

/// What a plan watches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchKind {
    /// A single key
    Key(String),
    /// Every key under a prefix
    KeyPrefix(String),
}

/// Data handed to a plan handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchResult {
    /// `None` when the key does not exist
    Key(Option<KvEntry>),
    KeyPrefix(Vec<KvEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchPlan {
    kind: WatchKind,
    datacenter: Option<String>,
    token: Option<String>,
    stale: bool,
    retry_interval: Duration,
    max_backoff: Duration,
    wait_time: Option<Duration>,
}

impl WatchPlan {
    /// Builds a plan from watch parameters.
    ///
    /// Recognised parameters are `type` (`key` or `keyprefix`), `key` or
    /// `prefix` depending on the type, and the optional `datacenter`, `token`
    /// and `stale`. Anything else is rejected.
    pub fn parse(params: &Map<String, Value>) -> std::result::Result<Self, WatchPlanError> {
        let mut params = params.clone();

        let datacenter = take_string(&mut params, "datacenter")?;
        let token = take_string(&mut params, "token")?;
        let watch_type = take_string(&mut params, "type")?;
        let stale = take_bool(&mut params, "stale")?.unwrap_or(false);

        let kind = match watch_type.as_deref() {
            None | Some("") => return Err(WatchPlanError::MissingType),
            Some("key") => WatchKind::Key(take_required(&mut params, "key")?),
            Some("keyprefix") => WatchKind::KeyPrefix(take_required(&mut params, "prefix")?),
            Some(other) => return Err(WatchPlanError::UnsupportedType(other.to_string())),
        };

        if !params.is_empty() {
            let mut unknown: Vec<String> = params.keys().cloned().collect();
            unknown.sort();
            return Err(WatchPlanError::UnknownParameters(unknown));
        }

        Ok(Self {
            kind,
            datacenter: datacenter.filter(|dc| !dc.is_empty()),
            token: token.filter(|t| !t.is_empty()),
            stale,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            wait_time: None,
        })
    }

    /// Overrides the retry delays of failed queries
    pub fn with_backoff(
        mut self,
        retry_interval: Duration,
        max_backoff: Duration,
    ) -> Self {
        self.retry_interval = retry_interval;
        self.max_backoff = max_backoff;
        self
    }

    /// Overrides the server-side wait of each blocking query
    pub fn with_wait_time(
        mut self,
        wait_time: Duration,
    ) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    pub fn kind(&self) -> &WatchKind {
        &self.kind
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn stale(&self) -> bool {
        self.stale
    }

    /// Delay before the retry following `failures` consecutive errors
    pub fn backoff(
        &self,
        failures: u32,
    ) -> Duration {
        self.retry_interval
            .checked_mul(failures.saturating_mul(failures))
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Long-polls `api` until `stop` is cancelled or `handler` returns false.
    ///
    /// The handler sees `(index, result)` only when the result differs from the
    /// previous one. After a failed query the next result is always delivered.
    pub async fn run<A, H, Fut>(
        &self,
        api: &A,
        stop: &CancellationToken,
        mut handler: H,
    ) where
        A: KvApi + ?Sized,
        H: FnMut(u64, WatchResult) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut failures: u32 = 0;
        let mut last_index: Option<u64> = None;
        let mut last_result: Option<WatchResult> = None;

        while !stop.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                fetched = self.fetch(api, last_index.unwrap_or(0)) => fetched,
            };

            match fetched {
                Err(e) => {
                    failures = failures.saturating_add(1);
                    last_index = None;
                    let retry = self.backoff(failures);
                    WATCH_ERRORS_METRIC.with_label_values(&[PLAN_STRATEGY]).inc();
                    error!(target: "consul_watch", kind = ?self.kind, error = %e, ?retry, "watch errored");

                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(retry) => continue,
                    }
                }
                Ok((index, result)) => {
                    failures = 0;

                    if last_index == Some(index) {
                        trace!(target: "consul_watch", index, "index unchanged");
                        continue;
                    }

                    let previous = last_index;
                    last_index = Some(next_index(previous, index));
                    if previous.is_some() && last_result.as_ref() == Some(&result) {
                        trace!(target: "consul_watch", index, "result unchanged");
                        continue;
                    }

                    last_result = Some(result.clone());
                    WATCH_EVENTS_METRIC.with_label_values(&[PLAN_STRATEGY]).inc();
                    if !handler(index, result).await {
                        debug!(target: "consul_watch", kind = ?self.kind, "handler closed");
                        break;
                    }
                }
            }
        }

        debug!(target: "consul_watch", kind = ?self.kind, "watch plan stopped");
    }

    fn query_options(
        &self,
        wait_index: u64,
    ) -> QueryOptions {
        QueryOptions {
            datacenter: self.datacenter.clone(),
            token: self.token.clone(),
            allow_stale: self.stale,
            wait_index,
            wait_time: self.wait_time,
        }
    }

    async fn fetch<A: KvApi + ?Sized>(
        &self,
        api: &A,
        wait_index: u64,
    ) -> Result<(u64, WatchResult)> {
        let opts = self.query_options(wait_index);
        match &self.kind {
            WatchKind::Key(key) => {
                let (entry, meta) = api.get(key, &opts).await?;
                Ok((meta.last_index, WatchResult::Key(entry)))
            }
            WatchKind::KeyPrefix(prefix) => {
                let (entries, meta) = api.list(prefix, &opts).await?;
                Ok((meta.last_index, WatchResult::KeyPrefix(entries)))
            }
        }
    }
}

/// Index to block on next; a server index that went backwards restarts at 0
fn next_index(
    previous: Option<u64>,
    index: u64,
) -> u64 {
    match previous {
        Some(prev) if prev > index => 0,
        _ => index,
    }
}

fn take_string(
    params: &mut Map<String, Value>,
    name: &str,
) -> std::result::Result<Option<String>, WatchPlanError> {
    match params.remove(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(WatchPlanError::InvalidParameter {
            name: name.to_string(),
            expected: "string",
        }),
    }
}

fn take_bool(
    params: &mut Map<String, Value>,
    name: &str,
) -> std::result::Result<Option<bool>, WatchPlanError> {
    match params.remove(name) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(_) => Err(WatchPlanError::InvalidParameter {
            name: name.to_string(),
            expected: "bool",
        }),
    }
}

fn take_required(
    params: &mut Map<String, Value>,
    name: &'static str,
) -> std::result::Result<String, WatchPlanError> {
    match take_string(params, name)? {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(WatchPlanError::MissingParameter(name)),
    }
}
