use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::Error;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn test_get_existing_key() {
    let store = MemoryStore::with_pairs([("key1", "value1")]);

    let value = store.get("key1").await.unwrap();
    assert_eq!(value, Bytes::from("value1"));
}

#[tokio::test]
async fn test_get_missing_key_returns_not_found() {
    let store = MemoryStore::new();

    let err = store.get("missing").await.unwrap_err();
    assert!(matches!(err, Error::KeyNotFound { ref key } if key == "missing"));
    assert_eq!(err.to_string(), "Key ( missing ) was not found.");
}

#[tokio::test]
async fn test_list_returns_prefix_matches_in_key_order() {
    let store = MemoryStore::with_pairs([
        ("key2", "value2"),
        ("other", "x"),
        ("key1", "value1"),
        ("kez", "y"),
    ]);

    let pairs = store.list("key").await.unwrap();
    assert_eq!(
        pairs,
        vec![KvPair::new("key1", "value1"), KvPair::new("key2", "value2")]
    );
}

#[tokio::test]
async fn test_list_unknown_prefix_is_empty() {
    let store = MemoryStore::with_pairs([("a", "1")]);

    assert!(store.list("zzz").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_set_strips_leading_slash() {
    let store = MemoryStore::new();

    store.set("/app/port", b"8080").await.unwrap();

    assert_eq!(store.get("app/port").await.unwrap(), Bytes::from("8080"));
    assert_eq!(store.list("app/").await.unwrap()[0].key, "app/port");
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_delete_reports_existence() {
    let store = MemoryStore::with_pairs([("k", "v")]);

    assert!(store.delete("k"));
    assert!(!store.delete("k"));
    assert!(store.is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_watch_emits_current_then_updates() {
    let store = MemoryStore::with_pairs([("key1", "value1")]);
    let stop = CancellationToken::new();
    let mut updates = store.watch("key1", stop.clone());

    let first = timeout(RECV_TIMEOUT, updates.next()).await.unwrap().unwrap();
    assert_eq!(first.unwrap(), Some(Bytes::from("value1")));

    store.set("key1", b"value2").await.unwrap();
    let second = timeout(RECV_TIMEOUT, updates.next()).await.unwrap().unwrap();
    assert_eq!(second.unwrap(), Some(Bytes::from("value2")));

    store.delete("key1");
    let third = timeout(RECV_TIMEOUT, updates.next()).await.unwrap().unwrap();
    assert_eq!(third.unwrap(), None);

    stop.cancel();
    let end = timeout(RECV_TIMEOUT, updates.next()).await.unwrap();
    assert!(end.is_none(), "stream must end after stop");
}

#[tokio::test]
async fn test_watch_missing_key_starts_with_none() {
    let store = MemoryStore::new();
    let stop = CancellationToken::new();
    let mut updates = store.watch("later", stop.clone());

    let first = timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(first.unwrap(), None);

    store.set("later", b"now").await.unwrap();
    let second = timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(second.unwrap(), Some(Bytes::from("now")));

    stop.cancel();
}

#[tokio::test]
async fn test_watch_ignores_other_keys_and_identical_writes() {
    let store = MemoryStore::with_pairs([("watched", "same")]);
    let stop = CancellationToken::new();
    let mut updates = store.watch("watched", stop.clone());
    let _ = timeout(RECV_TIMEOUT, updates.recv()).await.unwrap();

    store.set("unrelated", b"x").await.unwrap();
    store.set("watched", b"same").await.unwrap();

    assert!(
        timeout(Duration::from_millis(100), updates.recv()).await.is_err(),
        "no notification expected"
    );
    stop.cancel();
}

#[tokio::test]
async fn test_watchers_of_the_same_key_all_receive_updates() {
    let store = MemoryStore::new();
    let stop = CancellationToken::new();
    let mut a = store.watch("shared", stop.clone());
    let mut b = store.watch("shared", stop.clone());
    let _ = timeout(RECV_TIMEOUT, a.recv()).await.unwrap();
    let _ = timeout(RECV_TIMEOUT, b.recv()).await.unwrap();

    store.set("shared", b"v").await.unwrap();

    for stream in [&mut a, &mut b] {
        let got = timeout(RECV_TIMEOUT, stream.recv()).await.unwrap().unwrap();
        assert_eq!(got.unwrap(), Some(Bytes::from("v")));
    }
    stop.cancel();
}

#[tokio::test]
async fn test_watch_channel_released_after_last_watcher_stops() {
    let store = MemoryStore::new();
    let stop_a = CancellationToken::new();
    let stop_b = CancellationToken::new();
    let mut a = store.watch("shared", stop_a.clone());
    let mut b = store.watch("shared", stop_b.clone());
    let _ = timeout(RECV_TIMEOUT, a.recv()).await.unwrap();
    let _ = timeout(RECV_TIMEOUT, b.recv()).await.unwrap();
    assert_eq!(store.watched_keys(), 1);

    stop_a.cancel();
    store.set("shared", b"v").await.unwrap();
    let got = timeout(RECV_TIMEOUT, b.recv()).await.unwrap().unwrap();
    assert_eq!(got.unwrap(), Some(Bytes::from("v")));
    assert_eq!(store.watched_keys(), 1);

    drop(b);
    timeout(RECV_TIMEOUT, async {
        while store.watched_keys() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel should be released");

    let mut again = store.watch("shared", CancellationToken::new());
    let first = timeout(RECV_TIMEOUT, again.recv()).await.unwrap().unwrap();
    assert_eq!(first.unwrap(), Some(Bytes::from("v")));
}
