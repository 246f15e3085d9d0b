//! End-to-end tests for the persistent backend.

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use stashbox_core::{BlobCache, CacheError, ObjectCache, time};
use stashbox_sqlite::{SCHEMA_VERSION, SqliteCache};
use tempfile::TempDir;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Account {
    id: u64,
    email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Token {
    value: String,
}

#[tokio::test]
async fn round_trip_returns_the_same_bytes() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    cache
        .insert("a", Bytes::from_static(&[0x01, 0x02]), None)
        .await
        .unwrap();
    assert_eq!(cache.get("a").await.unwrap().as_ref(), &[0x01, 0x02]);

    let created = cache.get_created_at("a").await.unwrap().unwrap();
    let now = Utc::now();
    assert!((now - created).num_seconds().abs() <= 1);
}

#[tokio::test]
async fn missing_keys_fail_with_key_not_found() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    assert!(matches!(
        cache.get("missing").await,
        Err(CacheError::KeyNotFound(_))
    ));
    assert_eq!(cache.get_created_at("missing").await.unwrap(), None);
}

#[tokio::test]
async fn expired_entries_are_invisible_and_physically_deleted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    let cache = SqliteCache::open(&path).await.unwrap();

    let past = Utc::now() - chrono::Duration::seconds(1);
    cache
        .insert("k", Bytes::from_static(b"v"), Some(past))
        .await
        .unwrap();

    assert!(cache.get_all_keys().await.unwrap().is_empty());
    assert!(matches!(cache.get("k").await, Err(CacheError::KeyNotFound(_))));
    cache.flush().await.unwrap();

    // The read evicted the row: a raw connection sees nothing.
    let conn = rusqlite_check::open(&path);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM CacheElement WHERE Key='k'", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn bulk_get_returns_only_present_entries() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    cache
        .insert_many(
            vec![
                ("a".to_owned(), Bytes::from_static(b"1")),
                ("b".to_owned(), Bytes::from_static(b"2")),
            ],
            None,
        )
        .await
        .unwrap();

    let found = cache
        .get_many(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found["a"].as_ref(), b"1");
    assert_eq!(found["b"].as_ref(), b"2");
}

#[tokio::test]
async fn typed_objects_filter_by_type() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    let account = Account {
        id: 7,
        email: "ada@example.com".into(),
    };
    let token = Token {
        value: "secret".into(),
    };
    cache.insert_object("x", &account, None).await.unwrap();
    cache.insert_object("y", &token, None).await.unwrap();

    let accounts: Vec<Account> = cache.get_all_objects().await.unwrap();
    assert_eq!(accounts, vec![account.clone()]);

    let decoded: Account = cache.get_object("x").await.unwrap();
    assert_eq!(decoded, account);

    cache.invalidate_all_objects::<Account>().await.unwrap();
    assert!(cache.get_all_objects::<Account>().await.unwrap().is_empty());
    assert_eq!(cache.get_all_objects::<Token>().await.unwrap().len(), 1);
}

#[tokio::test]
async fn writes_survive_reopening_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");

    {
        let cache = SqliteCache::open(&path).await.unwrap();
        cache
            .insert("persist", Bytes::from_static(b"durable"), None)
            .await
            .unwrap();
        cache.flush().await.unwrap();
        cache.dispose().await.unwrap();
        cache.wait_for_shutdown().await;
    }

    let cache = SqliteCache::open(&path).await.unwrap();
    assert_eq!(cache.get("persist").await.unwrap().as_ref(), b"durable");
}

#[tokio::test]
async fn schema_version_is_recorded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    let cache = SqliteCache::open(&path).await.unwrap();
    cache.flush().await.unwrap();

    let conn = rusqlite_check::open(&path);
    let version: i64 = conn
        .query_row(
            "SELECT Version FROM SchemaInfo ORDER BY Version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn legacy_v1_files_are_migrated_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");

    {
        let conn = rusqlite_check::open(&path);
        conn.execute_batch(
            "CREATE TABLE CacheElement (
                Key        TEXT PRIMARY KEY NOT NULL,
                TypeName   TEXT NULL,
                Value      BLOB NOT NULL,
                Expiration INTEGER NOT NULL
            );",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO CacheElement (Key, TypeName, Value, Expiration) VALUES (?1, NULL, ?2, ?3)",
            rusqlite::params!["legacy", b"old-bytes".as_slice(), i64::MAX],
        )
        .unwrap();
    }

    let before = Utc::now();
    let cache = SqliteCache::open(&path).await.unwrap();

    assert_eq!(cache.get("legacy").await.unwrap().as_ref(), b"old-bytes");
    let created = cache.get_created_at("legacy").await.unwrap().unwrap();
    assert!((created - before).num_seconds().abs() <= 1);

    cache.flush().await.unwrap();
    let conn = rusqlite_check::open(&path);
    let version: i64 = conn
        .query_row(
            "SELECT Version FROM SchemaInfo ORDER BY Version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn concurrent_reads_of_one_key_share_results() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    cache
        .insert("hot", Bytes::from_static(b"shared"), None)
        .await
        .unwrap();

    let reads = (0..100).map(|_| {
        let cache = cache.clone();
        async move { cache.get("hot").await }
    });
    let results = join_all(reads).await;

    for result in results {
        assert_eq!(result.unwrap().as_ref(), b"shared");
    }
    // Batching merges overlapping requests: far fewer SELECTs than reads.
    assert!(cache.stats().select_statements() < 100);
}

#[tokio::test]
async fn vacuum_purges_expired_rows() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    let past = Utc::now() - chrono::Duration::seconds(5);
    let future = Utc::now() + chrono::Duration::hours(1);
    cache
        .insert("dead", Bytes::from_static(b"a"), Some(past))
        .await
        .unwrap();
    cache
        .insert("live", Bytes::from_static(b"b"), Some(future))
        .await
        .unwrap();

    cache.vacuum().await.unwrap();

    let keys = cache.get_all_keys().await.unwrap();
    assert_eq!(keys, vec!["live"]);
}

#[tokio::test]
async fn insert_replaces_atomically() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    cache.insert("k", Bytes::from_static(b"one"), None).await.unwrap();
    cache.insert("k", Bytes::from_static(b"two"), None).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap().as_ref(), b"two");
    assert_eq!(cache.get_all_keys().await.unwrap().len(), 1);
}

#[tokio::test]
async fn program_order_is_preserved_per_caller() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    for i in 0..20u8 {
        cache.insert("seq", Bytes::from(vec![i]), None).await.unwrap();
        assert_eq!(cache.get("seq").await.unwrap().as_ref(), &[i]);
    }
}

#[tokio::test]
async fn disposed_caches_reject_everything() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    cache.insert("k", Bytes::from_static(b"v"), None).await.unwrap();

    cache.dispose().await.unwrap();
    cache.wait_for_shutdown().await;

    assert!(matches!(cache.get("k").await, Err(CacheError::Disposed)));
    assert!(matches!(
        cache.insert("k", Bytes::new(), None).await,
        Err(CacheError::Disposed)
    ));
    assert!(matches!(cache.flush().await, Err(CacheError::Disposed)));

    // Idempotent.
    cache.dispose().await.unwrap();
}

#[tokio::test]
async fn ticks_on_disk_round_trip_expirations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    let cache = SqliteCache::open(&path).await.unwrap();

    let expiration = Utc::now() + chrono::Duration::hours(3);
    cache
        .insert("k", Bytes::from_static(b"v"), Some(expiration))
        .await
        .unwrap();
    cache.flush().await.unwrap();

    let conn = rusqlite_check::open(&path);
    let stored: i64 = conn
        .query_row("SELECT Expiration FROM CacheElement WHERE Key='k'", [], |row| {
            row.get(0)
        })
        .unwrap();
    let decoded = time::expiration_from_ticks(stored).unwrap();
    // Tick resolution is 100 ns; the round-trip loses at most one tick.
    assert!((decoded - expiration).num_milliseconds().abs() < 1);
}

#[tokio::test]
async fn empty_keys_are_rejected() {
    let cache = SqliteCache::open_in_memory().await.unwrap();
    assert!(matches!(
        cache.insert("", Bytes::new(), None).await,
        Err(CacheError::ArgumentInvalid(_))
    ));
    assert!(matches!(
        cache.get("").await,
        Err(CacheError::ArgumentInvalid(_))
    ));
}

/// Raw read-side checks against the same database file.
mod rusqlite_check {
    use std::path::Path;

    pub fn open(path: &Path) -> rusqlite::Connection {
        rusqlite::Connection::open(path).unwrap()
    }
}
