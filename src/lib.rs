//! Key-value backends of a configuration distribution tool.
//!
//! Every backend implements [`Store`]: read a key, list a prefix, write a key
//! and watch a key for changes. [`ConsulStore`] talks to a Consul agent over
//! its HTTP KV API; [`MemoryStore`] keeps everything in process.
//!
//! Configuration is layered through [`BackendConfig`] and logging goes
//! through `tracing`; the host application installs the subscriber.

mod backend;
mod config;
mod consul;
mod errors;
mod metrics;
mod scoped_timer;

pub use backend::*;
pub use crate::config::*;
pub use consul::*;
pub use errors::*;
pub use metrics::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
