//! Consul `/v1/kv` HTTP client.
//!
//! Only the calls the stores need are implemented: read a key, read a tree,
//! write a key and delete a tree. Reads support blocking queries through
//! [`QueryOptions::wait_index`].

use std::time::Duration;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use reqwest::header::HeaderMap;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Deserializer;
use tracing::debug;
use tracing::error;
use url::Url;

use crate::ConsulConfig;
use crate::ConsulError;
use crate::Result;

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";
const LAST_CONTACT_HEADER: &str = "X-Consul-LastContact";
const KNOWN_LEADER_HEADER: &str = "X-Consul-KnownLeader";

/// Wait used for blocking queries that do not set one explicitly
const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(300);
/// Longest wait the agent honours
const MAX_WAIT_TIME: Duration = Duration::from_secs(600);

/// A KV entry as stored by Consul
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvEntry {
    pub key: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub lock_index: u64,
    #[serde(default)]
    pub flags: u64,
    /// Raw value, `None` when Consul holds an empty value
    #[serde(default, deserialize_with = "deserialize_base64")]
    pub value: Option<Bytes>,
    #[serde(default)]
    pub session: Option<String>,
}

impl KvEntry {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ..Self::default()
        }
    }
}

fn deserialize_base64<'de, D>(deserializer: D) -> std::result::Result<Option<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        None => Ok(None),
        Some(s) => STANDARD
            .decode(s.as_bytes())
            .map(|v| Some(Bytes::from(v)))
            .map_err(serde::de::Error::custom),
    }
}

/// Per-request read parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub datacenter: Option<String>,
    pub token: Option<String>,
    /// Let any server answer, not only the leader
    pub allow_stale: bool,
    /// Block until the index moves past this value (0 disables blocking)
    pub wait_index: u64,
    /// Upper bound of the server-side wait of a blocking query
    pub wait_time: Option<Duration>,
}

/// Per-request write parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub datacenter: Option<String>,
    pub token: Option<String>,
}

/// Response metadata of a read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// `X-Consul-Index`, the wait index of the next blocking query
    pub last_index: u64,
    pub last_contact: Duration,
    pub known_leader: bool,
    pub request_time: Duration,
}

/// Response metadata of a write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteMeta {
    pub request_time: Duration,
}

/// KV calls the stores are built on.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait KvApi: Send + Sync + 'static {
    /// Reads one key. `Ok((None, meta))` when the key does not exist.
    async fn get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<KvEntry>, QueryMeta)>;

    /// Reads every entry under `prefix`, in key order.
    async fn list(
        &self,
        prefix: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<KvEntry>, QueryMeta)>;

    /// Writes one entry. Keys must not begin with `/`.
    async fn put(
        &self,
        entry: &KvEntry,
        opts: &WriteOptions,
    ) -> Result<WriteMeta>;

    /// Deletes every entry under `prefix`.
    async fn delete_tree(
        &self,
        prefix: &str,
        opts: &WriteOptions,
    ) -> Result<WriteMeta>;
}

/// HTTP client of a single Consul agent
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl ConsulClient {
    /// Builds a client for the agent described by `config`.
    ///
    /// # Errors
    /// - [`ConsulError::InvalidAddress`] if scheme and address do not form a base URL
    /// - [`ConsulError::ClientBuild`] if the HTTP client cannot be created
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        // an address such as `https://host:8501` overrides `scheme`
        let mut config = config.clone();
        let address = config.address.clone();
        config.set_address(&address);

        let raw = format!("{}://{}", config.scheme, config.address);
        let base_url = Url::parse(&raw).map_err(|e| ConsulError::InvalidAddress {
            address: config.address.clone(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConsulError::InvalidAddress {
                address: config.address.clone(),
                reason: "not a base URL".to_string(),
            }
            .into());
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(ConsulError::ClientBuild)?;

        debug!(%base_url, "created consul client");

        Ok(Self {
            http,
            base_url,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn kv_url(
        &self,
        key: &str,
    ) -> Result<Url> {
        let key = key.strip_prefix('/').unwrap_or(key);
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| ConsulError::InvalidAddress {
                address: self.base_url.to_string(),
                reason: "not a base URL".to_string(),
            })?;
            segments.pop_if_empty().extend(["v1", "kv"]);
            segments.extend(key.split('/'));
        }
        Ok(url)
    }

    fn read_request(
        &self,
        mut url: Url,
        opts: &QueryOptions,
        recurse: bool,
    ) -> (RequestBuilder, Duration) {
        let mut timeout = self.request_timeout;
        {
            let mut query = url.query_pairs_mut();
            if recurse {
                query.append_pair("recurse", "");
            }
            if let Some(dc) = &opts.datacenter {
                query.append_pair("dc", dc);
            }
            if opts.allow_stale {
                query.append_pair("stale", "");
            }
            if opts.wait_index > 0 {
                let wait = opts.wait_time.unwrap_or(DEFAULT_WAIT_TIME).min(MAX_WAIT_TIME);
                query.append_pair("index", &opts.wait_index.to_string());
                query.append_pair("wait", &format!("{}ms", wait.as_millis()));
                // the agent adds up to wait/16 of jitter
                timeout = timeout.saturating_add(wait + wait / 16);
            }
        }
        let url = strip_empty_query(url);

        let mut request = self.http.get(url).timeout(timeout);
        if let Some(token) = &opts.token {
            request = request.header(TOKEN_HEADER, token);
        }
        (request, timeout)
    }

    fn write_request(
        &self,
        method: reqwest::Method,
        mut url: Url,
        opts: &WriteOptions,
        extra: &[(&str, String)],
    ) -> RequestBuilder {
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in extra {
                query.append_pair(k, v);
            }
            if let Some(dc) = &opts.datacenter {
                query.append_pair("dc", dc);
            }
        }
        let url = strip_empty_query(url);

        let mut request = self.http.request(method, url).timeout(self.request_timeout);
        if let Some(token) = &opts.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    async fn execute(
        &self,
        method: &'static str,
        path: &str,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Response> {
        request.send().await.map_err(|source| {
            error!("[:ConsulClient:{method}] {path} failed: {source}");
            if source.is_timeout() {
                ConsulError::Timeout {
                    path: path.to_string(),
                    duration: timeout,
                }
                .into()
            } else {
                ConsulError::Transport {
                    method,
                    path: path.to_string(),
                    source,
                }
                .into()
            }
        })
    }

    async fn read(
        &self,
        key: &str,
        opts: &QueryOptions,
        recurse: bool,
    ) -> Result<(Vec<KvEntry>, QueryMeta)> {
        let started = Instant::now();
        let url = self.kv_url(key)?;
        let path = url.path().to_string();
        let (request, timeout) = self.read_request(url, opts, recurse);

        let response = self.execute("GET", &path, request, timeout).await?;
        let status = response.status();
        if status != StatusCode::NOT_FOUND && !status.is_success() {
            return Err(unexpected_status(response).await);
        }

        let mut meta = parse_query_meta(&path, response.headers())?;
        meta.request_time = started.elapsed();

        if status == StatusCode::NOT_FOUND {
            debug!(path = %path, index = meta.last_index, "key not found");
            return Ok((Vec::new(), meta));
        }

        let body = response.bytes().await.map_err(|source| ConsulError::Transport {
            method: "GET",
            path: path.clone(),
            source,
        })?;
        let entries: Vec<KvEntry> = serde_json::from_slice(&body).map_err(|e| ConsulError::Decode {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        debug!(path = %path, index = meta.last_index, entries = entries.len(), "kv read");
        Ok((entries, meta))
    }
}

#[async_trait::async_trait]
impl KvApi for ConsulClient {
    async fn get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<KvEntry>, QueryMeta)> {
        let (entries, meta) = self.read(key, opts, false).await?;
        Ok((entries.into_iter().next(), meta))
    }

    async fn list(
        &self,
        prefix: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<KvEntry>, QueryMeta)> {
        self.read(prefix, opts, true).await
    }

    async fn put(
        &self,
        entry: &KvEntry,
        opts: &WriteOptions,
    ) -> Result<WriteMeta> {
        if entry.key.starts_with('/') {
            return Err(ConsulError::InvalidKey(entry.key.clone()).into());
        }

        let started = Instant::now();
        let url = self.kv_url(&entry.key)?;
        let path = url.path().to_string();

        let mut extra = Vec::new();
        if entry.flags != 0 {
            extra.push(("flags", entry.flags.to_string()));
        }
        let request = self
            .write_request(reqwest::Method::PUT, url, opts, &extra)
            .body(entry.value.clone().unwrap_or_default());

        let response = self.execute("PUT", &path, request, self.request_timeout).await?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }

        if !read_bool_body("PUT", &path, response).await? {
            return Err(ConsulError::WriteRejected {
                key: entry.key.clone(),
            }
            .into());
        }

        debug!(path = %path, "kv put");
        Ok(WriteMeta {
            request_time: started.elapsed(),
        })
    }

    async fn delete_tree(
        &self,
        prefix: &str,
        opts: &WriteOptions,
    ) -> Result<WriteMeta> {
        let started = Instant::now();
        let url = self.kv_url(prefix)?;
        let path = url.path().to_string();

        let extra = [("recurse", String::new())];
        let request = self.write_request(reqwest::Method::DELETE, url, opts, &extra);

        let response = self.execute("DELETE", &path, request, self.request_timeout).await?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }
        read_bool_body("DELETE", &path, response).await?;

        debug!(path = %path, "kv delete tree");
        Ok(WriteMeta {
            request_time: started.elapsed(),
        })
    }
}

/// Drops the `?` an untouched `query_pairs_mut` leaves behind
fn strip_empty_query(mut url: Url) -> Url {
    if url.query() == Some("") {
        url.set_query(None);
    }
    url
}

async fn unexpected_status(response: Response) -> crate::Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    error!(status, body = %body, "unexpected consul response");
    ConsulError::UnexpectedStatus {
        status,
        body: body.trim().to_string(),
    }
    .into()
}

async fn read_bool_body(
    method: &'static str,
    path: &str,
    response: Response,
) -> Result<bool> {
    let text = response.text().await.map_err(|source| ConsulError::Transport {
        method,
        path: path.to_string(),
        source,
    })?;
    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConsulError::Decode {
            path: path.to_string(),
            reason: format!("expected true or false, got {other:?}"),
        }
        .into()),
    }
}

pub(crate) fn parse_query_meta(
    path: &str,
    headers: &HeaderMap,
) -> Result<QueryMeta> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let last_index = header(INDEX_HEADER)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ConsulError::Decode {
            path: path.to_string(),
            reason: format!("Failed to parse {INDEX_HEADER}"),
        })?;

    let last_contact = header(LAST_CONTACT_HEADER)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_default();

    let known_leader = header(KNOWN_LEADER_HEADER) == Some("true");

    Ok(QueryMeta {
        last_index,
        last_contact,
        known_leader,
        request_time: Duration::ZERO,
    })
}
