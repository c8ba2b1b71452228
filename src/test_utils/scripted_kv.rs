use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::ConsulError;
use crate::Error;
use crate::KvApi;
use crate::KvEntry;
use crate::QueryMeta;
use crate::QueryOptions;
use crate::Result;
use crate::WriteMeta;
use crate::WriteOptions;

type GetReply = Result<(Option<KvEntry>, QueryMeta)>;
type ListReply = Result<(Vec<KvEntry>, QueryMeta)>;

/// `KvApi` answering reads from a script.
///
/// Each read takes the next scripted reply; with nothing queued the read
/// blocks like a long-poll that never returns. Every read records the
/// options it was called with. Writes always succeed.
pub(crate) struct ScriptedKv {
    gets: tokio::sync::Mutex<mpsc::UnboundedReceiver<GetReply>>,
    lists: tokio::sync::Mutex<mpsc::UnboundedReceiver<ListReply>>,
    calls: Mutex<Vec<QueryOptions>>,
}

/// Feeding side of a [`ScriptedKv`]
#[derive(Clone)]
pub(crate) struct Script {
    gets: mpsc::UnboundedSender<GetReply>,
    lists: mpsc::UnboundedSender<ListReply>,
}

impl Script {
    pub(crate) fn get(
        &self,
        entry: Option<KvEntry>,
        index: u64,
    ) -> &Self {
        let _ = self.gets.send(Ok((entry, super::meta(index))));
        self
    }

    pub(crate) fn get_err(
        &self,
        status: u16,
    ) -> &Self {
        let _ = self.gets.send(Err(Error::Consul(ConsulError::UnexpectedStatus {
            status,
            body: "scripted failure".to_string(),
        })));
        self
    }

    pub(crate) fn list(
        &self,
        entries: Vec<KvEntry>,
        index: u64,
    ) -> &Self {
        let _ = self.lists.send(Ok((entries, super::meta(index))));
        self
    }
}

impl ScriptedKv {
    pub(crate) fn new() -> (Self, Script) {
        let (gets_tx, gets_rx) = mpsc::unbounded_channel();
        let (lists_tx, lists_rx) = mpsc::unbounded_channel();
        (
            Self {
                gets: tokio::sync::Mutex::new(gets_rx),
                lists: tokio::sync::Mutex::new(lists_rx),
                calls: Mutex::new(Vec::new()),
            },
            Script {
                gets: gets_tx,
                lists: lists_tx,
            },
        )
    }

    /// Options of every read issued so far
    pub(crate) fn calls(&self) -> Vec<QueryOptions> {
        self.calls.lock().clone()
    }

    /// Wait indexes of every read issued so far
    pub(crate) fn wait_indexes(&self) -> Vec<u64> {
        self.calls.lock().iter().map(|o| o.wait_index).collect()
    }
}

#[async_trait::async_trait]
impl KvApi for ScriptedKv {
    async fn get(
        &self,
        _key: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<KvEntry>, QueryMeta)> {
        self.calls.lock().push(opts.clone());
        match self.gets.lock().await.recv().await {
            Some(reply) => reply,
            None => std::future::pending().await,
        }
    }

    async fn list(
        &self,
        _prefix: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<KvEntry>, QueryMeta)> {
        self.calls.lock().push(opts.clone());
        match self.lists.lock().await.recv().await {
            Some(reply) => reply,
            None => std::future::pending().await,
        }
    }

    async fn put(
        &self,
        _entry: &KvEntry,
        _opts: &WriteOptions,
    ) -> Result<WriteMeta> {
        Ok(WriteMeta::default())
    }

    async fn delete_tree(
        &self,
        _prefix: &str,
        _opts: &WriteOptions,
    ) -> Result<WriteMeta> {
        Ok(WriteMeta::default())
    }
}
