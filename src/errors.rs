//! Key-value backend error hierarchy
//!
//! Errors are grouped by the layer that raised them: the remote Consul agent,
//! watch plan construction, and configuration loading.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested key does not exist in the backend
    #[error("Key ( {key} ) was not found.")]
    KeyNotFound { key: String },

    /// Failures talking to the Consul HTTP API
    #[error(transparent)]
    Consul(#[from] ConsulError),

    /// Watch plan parameters could not be turned into a plan
    #[error(transparent)]
    WatchPlan(#[from] WatchPlanError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    pub(crate) fn not_found(key: impl Into<String>) -> Self {
        Error::KeyNotFound { key: key.into() }
    }

    /// Returns true if the error reports a missing key
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsulError {
    /// Agent address could not be turned into a base URL
    #[error("Invalid Consul address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Consul refuses keys with a leading slash on writes
    #[error("Invalid key {0:?}. Key must not begin with a '/'")]
    InvalidKey(String),

    /// HTTP client construction failures
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// Request could not be sent or the response body could not be read
    #[error("Request {method} {path} failed: {source}")]
    Transport {
        method: &'static str,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// The agent answered with a non-success status
    #[error("Unexpected response code: {status} ({body})")]
    UnexpectedStatus { status: u16, body: String },

    /// Response body or headers did not have the expected shape
    #[error("Failed to decode response from {path}: {reason}")]
    Decode { path: String, reason: String },

    /// PUT returned `false`
    #[error("Write of key {key} was rejected by the agent")]
    WriteRejected { key: String },

    /// Blocking query exceeded its deadline
    #[error("Request {path} timed out after {duration:?}")]
    Timeout { path: String, duration: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum WatchPlanError {
    #[error("Watch type must be specified")]
    MissingType,

    #[error("Unsupported watch type: {0}")]
    UnsupportedType(String),

    #[error("Must specify a single {0} to watch")]
    MissingParameter(&'static str),

    #[error("Expecting {expected} for parameter {name}")]
    InvalidParameter {
        name: String,
        expected: &'static str,
    },

    #[error("Invalid parameters: {0:?}")]
    UnknownParameters(Vec<String>),
}
