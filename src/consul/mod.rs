//! Consul key-value backend
//!
//! Provides the pieces behind [`ConsulStore`]:
//! - [`ConsulClient`] - HTTP client of the agent's `/v1/kv` endpoints
//! - [`WatchPlan`] - blocking-query loop with backoff and change detection
//! - [`ConsulStoreBuilder`] - configurable store construction
//!
//! # Basic Usage
//! ```no_run
//! use confkv::{new_store, Store};
//! use futures::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let store = new_store(&["127.0.0.1:8500".to_string()]).unwrap();
//!
//!     store.set("app/port", b"8080").await.unwrap();
//!     let port = store.get("app/port").await.unwrap();
//!     println!("port: {:?}", port);
//!
//!     let stop = CancellationToken::new();
//!     let mut updates = store.watch("app/port", stop.clone());
//!     if let Some(update) = updates.next().await {
//!         println!("changed: {:?}", update);
//!     }
//!     stop.cancel();
//! }
//! ```

mod api;
mod builder;
mod poll;
mod store;
mod watch;

pub use api::*;
pub use builder::*;
pub use store::*;
pub use watch::*;


use crate::BackendConfig;
use crate::Result;

/// Creates a Consul store from the layered configuration.
///
/// `machines[0]`, when given, replaces the configured agent address.
pub fn new_store(machines: &[String]) -> Result<ConsulStore> {
    let config = BackendConfig::new()?.validate()?;
    ConsulStore::new(machines, &config)
}
