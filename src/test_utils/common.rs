use std::time::Duration;

use bytes::Bytes;

use crate::KvEntry;
use crate::QueryMeta;

pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Entry as the agent would return it after a write at `index`
pub(crate) fn entry(
    key: &str,
    value: &str,
    index: u64,
) -> KvEntry {
    KvEntry {
        key: key.to_string(),
        create_index: index,
        modify_index: index,
        value: Some(Bytes::copy_from_slice(value.as_bytes())),
        ..KvEntry::default()
    }
}

pub(crate) fn meta(index: u64) -> QueryMeta {
    QueryMeta {
        last_index: index,
        known_leader: true,
        ..QueryMeta::default()
    }
}
