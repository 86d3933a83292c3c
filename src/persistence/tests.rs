use super::batching::BatchingMessageCache;
use super::file_cache::FileCache;
use super::memory::MemoryMessageCache;
use super::postgres_store::PostgresMessageCache;
use super::sqlite_store::{CURRENT_SCHEMA_VERSION, SqliteMessageCache};
use super::{MessageCache, create_message_cache};
use crate::broker::message::{Action, Attachment, Event, Message, SinceMarker};
use crate::config::CacheSettings;
use crate::utils::error::Error;
use crate::utils::limiter::FixedLimiter;
use crate::utils::random_string;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn now() -> i64 {
    Utc::now().timestamp()
}

fn message_at(topic: &str, time: i64, body: &str) -> Message {
    let mut m = Message::new_default(topic, body);
    m.time = time;
    m.expires = time + 3600;
    m
}

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

async fn create_test_sqlite() -> (SqliteMessageCache, TempDir) {
    let dir = tempdir().unwrap();
    let cache = SqliteMessageCache::open(
        dir.path().join("cache.db"),
        "",
        Duration::from_secs(3600),
    )
    .await
    .unwrap();
    (cache, dir)
}

async fn wait_for_count(cache: &dyn MessageCache, topic: &str, expected: usize) -> usize {
    let mut found = 0;
    for _ in 0..100 {
        found = cache
            .messages(topic, &SinceMarker::All, true)
            .await
            .unwrap()
            .len();
        if found == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    found
}

// Scenarios shared by every backend

async fn check_add_and_poll(cache: &dyn MessageCache) {
    let m = message_at("mytopic", now(), "hello");
    cache.add_message(&m).await.unwrap();

    let messages = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(ids(&messages), vec![m.id.clone()]);
    assert_eq!(messages[0].message, "hello");
    assert_eq!(messages[0].event, Event::Message);

    assert!(
        cache
            .messages("mytopic", &SinceMarker::Nothing, false)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        cache
            .messages("othertopic", &SinceMarker::All, false)
            .await
            .unwrap()
            .is_empty()
    );

    let keepalive = Message::keepalive("mytopic");
    assert!(matches!(
        cache.add_message(&keepalive).await,
        Err(Error::UnexpectedMessageType)
    ));
    let open = Message::open("mytopic");
    assert!(matches!(
        cache.add_message(&open).await,
        Err(Error::UnexpectedMessageType)
    ));

    let mut again = message_at("mytopic", now(), "hello again");
    again.id = m.id.clone();
    assert!(matches!(
        cache.add_message(&again).await,
        Err(Error::DuplicateMessage(id)) if id == m.id
    ));
    let messages = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(ids(&messages), vec![m.id.clone()]);
    assert_eq!(messages[0].message, "hello");
}

async fn check_since_id(cache: &dyn MessageCache) {
    let m1 = message_at("mytopic", 1, "first");
    let other = message_at("othertopic", 1, "elsewhere");
    let m2 = message_at("mytopic", 2, "second");
    cache.add_message(&m1).await.unwrap();
    cache.add_message(&other).await.unwrap();
    cache.add_message(&m2).await.unwrap();

    let after_m1 = cache
        .messages("mytopic", &SinceMarker::Id(m1.id.clone()), false)
        .await
        .unwrap();
    assert_eq!(ids(&after_m1), vec![m2.id.clone()]);

    let after_m2 = cache
        .messages("mytopic", &SinceMarker::Id(m2.id.clone()), false)
        .await
        .unwrap();
    assert!(after_m2.is_empty());

    // IDs from another topic resolve to the same position in the shared timeline
    let after_other = cache
        .messages("mytopic", &SinceMarker::Id(other.id.clone()), false)
        .await
        .unwrap();
    assert_eq!(ids(&after_other), vec![m2.id.clone()]);

    let unknown = cache
        .messages("mytopic", &SinceMarker::Id("unknownid123".to_string()), false)
        .await
        .unwrap();
    let all = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(ids(&unknown), ids(&all));
    assert_eq!(ids(&all), vec![m1.id.clone(), m2.id.clone()]);
}

async fn check_since_time(cache: &dyn MessageCache) {
    let base = now() - 100;
    let m1 = message_at("mytopic", base, "old");
    let m2 = message_at("mytopic", base + 50, "newer");
    cache.add_messages(&[m1.clone(), m2.clone()]).await.unwrap();

    let since = cache
        .messages("mytopic", &SinceMarker::Time(base + 10), false)
        .await
        .unwrap();
    assert_eq!(ids(&since), vec![m2.id.clone()]);

    let inclusive = cache
        .messages("mytopic", &SinceMarker::Time(base), false)
        .await
        .unwrap();
    assert_eq!(ids(&inclusive), vec![m1.id, m2.id]);
}

async fn check_scheduled_ordering(cache: &dyn MessageCache) {
    let t = now();
    let m1 = message_at("mytopic", t, "now");
    let m2 = message_at("mytopic", t + 3600, "in an hour");
    let m3 = message_at("mytopic", t + 60, "in a minute");
    cache.add_message(&m1).await.unwrap();
    cache.add_message(&m2).await.unwrap();
    cache.add_message(&m3).await.unwrap();

    let published = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(ids(&published), vec![m1.id.clone()]);

    let with_scheduled = cache
        .messages("mytopic", &SinceMarker::All, true)
        .await
        .unwrap();
    assert_eq!(ids(&with_scheduled), vec![m1.id.clone(), m3.id.clone(), m2.id.clone()]);

    // Scheduled rows follow published ones even when an ID marker is used
    let since_m1 = cache
        .messages("mytopic", &SinceMarker::Id(m1.id.clone()), true)
        .await
        .unwrap();
    assert_eq!(ids(&since_m1), vec![m3.id, m2.id]);

    assert!(cache.messages_due().await.unwrap().is_empty());
}

async fn check_messages_due(cache: &dyn MessageCache) {
    let m = message_at("mytopic", now() + 1, "soon");
    cache.add_message(&m).await.unwrap();
    assert!(cache.messages_due().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let due = cache.messages_due().await.unwrap();
    assert_eq!(ids(&due), vec![m.id.clone()]);
    assert!(
        cache
            .messages("mytopic", &SinceMarker::All, false)
            .await
            .unwrap()
            .is_empty()
    );

    cache.mark_published(&m).await.unwrap();
    cache.mark_published(&m).await.unwrap();
    assert!(cache.messages_due().await.unwrap().is_empty());
    let published = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(ids(&published), vec![m.id]);
}

async fn check_expiry_and_pruning(cache: &dyn MessageCache) {
    let t = now();
    let mut expired = message_at("mytopic", t - 20, "expired");
    expired.expires = t - 10;
    let live = message_at("mytopic", t - 20, "live");
    let other = message_at("othertopic", t, "other");
    cache
        .add_messages(&[expired.clone(), live.clone(), other.clone()])
        .await
        .unwrap();

    let ids_expired = cache.messages_expired().await.unwrap();
    assert_eq!(ids_expired, vec![expired.id.clone()]);
    cache.delete_messages(&ids_expired).await.unwrap();

    let counts = cache.message_counts().await.unwrap();
    assert_eq!(counts.get("mytopic"), Some(&1));
    assert_eq!(counts.get("othertopic"), Some(&1));

    // A second pass with nothing newly expired changes nothing
    let again = cache.messages_expired().await.unwrap();
    assert!(again.is_empty());
    cache.delete_messages(&again).await.unwrap();
    assert_eq!(cache.message_counts().await.unwrap(), counts);

    cache
        .expire_messages(&["othertopic".to_string()])
        .await
        .unwrap();
    assert_eq!(cache.messages_expired().await.unwrap(), vec![other.id]);
    assert!(matches!(
        cache.message(&expired.id).await,
        Err(Error::MessageNotFound)
    ));
    assert_eq!(cache.message(&live.id).await.unwrap().message, "live");
}

async fn check_attachments(cache: &dyn MessageCache) {
    let t = now();
    let sender: IpAddr = "1.2.3.4".parse().unwrap();
    let attachment = |size: i64, expires: i64| Attachment {
        name: "file.txt".to_string(),
        content_type: "text/plain".to_string(),
        size,
        expires,
        url: "https://example.com/file.txt".to_string(),
    };

    let mut old = message_at("mytopic", t, "old attachment");
    old.sender = Some(sender);
    old.attachment = Some(attachment(100, t - 1));
    let mut anon = message_at("mytopic", t, "anonymous attachment");
    anon.sender = Some(sender);
    anon.attachment = Some(attachment(50, t + 3600));
    let mut owned = message_at("mytopic", t, "user attachment");
    owned.sender = Some(sender);
    owned.user = "u_1234".to_string();
    owned.attachment = Some(attachment(70, t + 3600));
    cache
        .add_messages(&[old.clone(), anon.clone(), owned.clone()])
        .await
        .unwrap();

    assert_eq!(
        cache.attachment_bytes_used_by_sender("1.2.3.4").await.unwrap(),
        50
    );
    assert_eq!(
        cache.attachment_bytes_used_by_user("u_1234").await.unwrap(),
        70
    );
    assert_eq!(
        cache.attachment_bytes_used_by_sender("5.6.7.8").await.unwrap(),
        0
    );

    let expired = cache.attachments_expired().await.unwrap();
    assert_eq!(expired, vec![old.id.clone()]);
    cache.mark_attachments_deleted(&expired).await.unwrap();
    assert!(cache.attachments_expired().await.unwrap().is_empty());

    cache
        .mark_attachments_deleted(&[anon.id.clone()])
        .await
        .unwrap();
    assert_eq!(
        cache.attachment_bytes_used_by_sender("1.2.3.4").await.unwrap(),
        0
    );
}

async fn check_fields_survive_storage(cache: &dyn MessageCache) {
    let mut m = message_at("mytopic", now(), "body");
    m.title = "Title".to_string();
    m.priority = 4;
    m.tags = vec!["warning".to_string(), "skull".to_string()];
    m.click = "https://example.com".to_string();
    m.icon = "https://example.com/icon.png".to_string();
    m.actions = vec![Action {
        id: "a1".to_string(),
        action: "view".to_string(),
        label: "Open".to_string(),
        url: "https://example.com/open".to_string(),
        ..Default::default()
    }];
    m.attachment = Some(Attachment {
        name: "img.png".to_string(),
        content_type: "image/png".to_string(),
        size: 1234,
        expires: now() + 100,
        url: "https://example.com/img.png".to_string(),
    });
    m.sender = Some("9.9.9.9".parse().unwrap());
    m.user = "u_abc".to_string();
    m.content_type = "text/markdown".to_string();
    m.encoding = "base64".to_string();
    cache.add_message(&m).await.unwrap();

    let stored = cache.message(&m.id).await.unwrap();
    assert_eq!(stored, m);
}

async fn check_batch_rollback(cache: &dyn MessageCache) {
    let valid = message_at("mytopic", now(), "valid");
    let invalid = Message::keepalive("mytopic");
    assert!(matches!(
        cache.add_messages(&[valid, invalid]).await,
        Err(Error::UnexpectedMessageType)
    ));
    assert!(
        cache
            .messages("mytopic", &SinceMarker::All, true)
            .await
            .unwrap()
            .is_empty()
    );

    let first = message_at("mytopic", now(), "first");
    let mut repeated = message_at("mytopic", now(), "repeated");
    repeated.id = first.id.clone();
    assert!(matches!(
        cache.add_messages(&[first, repeated]).await,
        Err(Error::DuplicateMessage(_))
    ));
    assert!(
        cache
            .messages("mytopic", &SinceMarker::All, true)
            .await
            .unwrap()
            .is_empty()
    );
}

async fn check_topics_and_stats(cache: &dyn MessageCache) {
    cache
        .add_messages(&[
            message_at("a", now(), "1"),
            message_at("a", now(), "2"),
            message_at("b", now(), "3"),
        ])
        .await
        .unwrap();
    let mut topics = cache.topics().await.unwrap();
    topics.sort();
    assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
    let counts = cache.message_counts().await.unwrap();
    assert_eq!(counts.get("a"), Some(&2));

    assert_eq!(cache.stats().await.unwrap(), 0);
    cache.update_stats(42).await.unwrap();
    assert_eq!(cache.stats().await.unwrap(), 42);
}

// Memory backend

#[tokio::test]
async fn test_memory_add_and_poll() {
    check_add_and_poll(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_since_id() {
    check_since_id(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_since_time() {
    check_since_time(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_scheduled_ordering() {
    check_scheduled_ordering(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_messages_due() {
    check_messages_due(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_expiry_and_pruning() {
    check_expiry_and_pruning(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_attachments() {
    check_attachments(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_fields_survive_storage() {
    check_fields_survive_storage(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_batch_rollback() {
    check_batch_rollback(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_memory_topics_and_stats() {
    check_topics_and_stats(&MemoryMessageCache::new()).await;
}

#[tokio::test]
async fn test_nop_cache_discards_messages() {
    let cache = MemoryMessageCache::nop();
    cache
        .add_message(&message_at("mytopic", now(), "gone"))
        .await
        .unwrap();
    assert!(
        cache
            .messages("mytopic", &SinceMarker::All, true)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(cache.topics().await.unwrap().is_empty());
    assert!(matches!(
        cache.add_message(&Message::keepalive("mytopic")).await,
        Err(Error::UnexpectedMessageType)
    ));
}

// SQLite backend

#[tokio::test]
async fn test_sqlite_add_and_poll() {
    let (cache, _dir) = create_test_sqlite().await;
    check_add_and_poll(&cache).await;
}

#[tokio::test]
async fn test_sqlite_since_id() {
    let (cache, _dir) = create_test_sqlite().await;
    check_since_id(&cache).await;
}

#[tokio::test]
async fn test_sqlite_since_time() {
    let (cache, _dir) = create_test_sqlite().await;
    check_since_time(&cache).await;
}

#[tokio::test]
async fn test_sqlite_scheduled_ordering() {
    let (cache, _dir) = create_test_sqlite().await;
    check_scheduled_ordering(&cache).await;
}

#[tokio::test]
async fn test_sqlite_messages_due() {
    let (cache, _dir) = create_test_sqlite().await;
    check_messages_due(&cache).await;
}

#[tokio::test]
async fn test_sqlite_expiry_and_pruning() {
    let (cache, _dir) = create_test_sqlite().await;
    check_expiry_and_pruning(&cache).await;
}

#[tokio::test]
async fn test_sqlite_attachments() {
    let (cache, _dir) = create_test_sqlite().await;
    check_attachments(&cache).await;
}

#[tokio::test]
async fn test_sqlite_fields_survive_storage() {
    let (cache, _dir) = create_test_sqlite().await;
    check_fields_survive_storage(&cache).await;
}

#[tokio::test]
async fn test_sqlite_batch_rollback() {
    let (cache, _dir) = create_test_sqlite().await;
    check_batch_rollback(&cache).await;
}

#[tokio::test]
async fn test_sqlite_topics_and_stats() {
    let (cache, _dir) = create_test_sqlite().await;
    check_topics_and_stats(&cache).await;
}

#[tokio::test]
async fn test_sqlite_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let m = message_at("mytopic", now(), "durable");
    {
        let cache = SqliteMessageCache::open(&path, "PRAGMA journal_mode = WAL;", Duration::ZERO)
            .await
            .unwrap();
        cache.add_message(&m).await.unwrap();
        cache.update_stats(7).await.unwrap();
        cache.close().await.unwrap();
    }
    let cache = SqliteMessageCache::open(&path, "", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(cache.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    assert_eq!(cache.stats().await.unwrap(), 7);
    let messages = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(ids(&messages), vec![m.id]);
}

#[tokio::test]
async fn test_sqlite_migrates_unversioned_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy.db");
    let created = now() - 60;
    {
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::raw_sql(
            "CREATE TABLE messages (id VARCHAR(20) PRIMARY KEY, time INT NOT NULL, topic VARCHAR(64) NOT NULL, message VARCHAR(1024) NOT NULL);",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO messages (id, time, topic, message) VALUES (?, ?, ?, ?)")
            .bind("abcdefghijkl")
            .bind(created)
            .bind("mytopic")
            .bind("from the old days")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    let cache = SqliteMessageCache::open(&path, "", Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(cache.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);

    let messages = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "abcdefghijkl");
    assert_eq!(messages[0].message, "from the old days");
    assert_eq!(messages[0].expires, created + 3600);
    assert!(messages[0].title.is_empty());
    assert_eq!(cache.stats().await.unwrap(), 0);

    // New rows work against the migrated schema
    let m = message_at("mytopic", now(), "new");
    cache.add_message(&m).await.unwrap();
    let after = cache
        .messages("mytopic", &SinceMarker::Id("abcdefghijkl".to_string()), false)
        .await
        .unwrap();
    assert_eq!(ids(&after), vec![m.id]);
}

#[tokio::test]
async fn test_sqlite_migration_drops_duplicate_ids() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let m = message_at("mytopic", now(), "kept");
    {
        let cache = SqliteMessageCache::open(&path, "", Duration::ZERO)
            .await
            .unwrap();
        cache.add_message(&m).await.unwrap();
        cache.close().await.unwrap();
    }
    {
        // Rewind to the layout before IDs were unique and sneak in a second row
        let options = SqliteConnectOptions::new().filename(&path);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::raw_sql(
            "DROP INDEX idx_mid; \
             CREATE INDEX idx_mid ON messages (mid); \
             INSERT INTO messages (mid, time, expires, topic, message, title, priority, tags, click, icon, actions, \
               attachment_name, attachment_type, attachment_size, attachment_expires, attachment_url, attachment_deleted, \
               sender, user, content_type, encoding, published) \
             SELECT mid, time, expires, topic, 'copy', title, priority, tags, click, icon, actions, \
               attachment_name, attachment_type, attachment_size, attachment_expires, attachment_url, attachment_deleted, \
               sender, user, content_type, encoding, published FROM messages; \
             UPDATE schemaVersion SET version = 11 WHERE id = 1;",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    let cache = SqliteMessageCache::open(&path, "", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(cache.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    let messages = cache
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "kept");
    assert!(matches!(
        cache.add_message(&m).await,
        Err(Error::DuplicateMessage(_))
    ));
}

#[tokio::test]
async fn test_sqlite_rejects_newer_schema() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
        let cache = SqliteMessageCache::open(&path, "", Duration::ZERO)
            .await
            .unwrap();
        cache.close().await.unwrap();
    }
    {
        let options = SqliteConnectOptions::new().filename(&path);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::query("UPDATE schemaVersion SET version = 99 WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }
    let result = SqliteMessageCache::open(&path, "", Duration::ZERO).await;
    assert!(matches!(
        result,
        Err(Error::SchemaTooNew {
            found: 99,
            current: CURRENT_SCHEMA_VERSION
        })
    ));
}

// Batching stage

#[tokio::test]
async fn test_batching_cache_writes_on_batch_size() {
    let inner = Arc::new(MemoryMessageCache::new());
    let cache = BatchingMessageCache::new(inner.clone(), 2, Duration::ZERO);

    cache
        .add_message(&message_at("mytopic", now(), "one"))
        .await
        .unwrap();
    assert_eq!(cache.pending(), 1);
    assert!(
        inner
            .messages("mytopic", &SinceMarker::All, false)
            .await
            .unwrap()
            .is_empty()
    );

    cache
        .add_message(&message_at("mytopic", now(), "two"))
        .await
        .unwrap();
    assert_eq!(wait_for_count(inner.as_ref(), "mytopic", 2).await, 2);
}

#[tokio::test]
async fn test_batching_cache_writes_on_timeout() {
    let inner = Arc::new(MemoryMessageCache::new());
    let cache = BatchingMessageCache::new(inner.clone(), 0, Duration::from_millis(50));
    cache
        .add_message(&message_at("mytopic", now(), "one"))
        .await
        .unwrap();
    assert_eq!(wait_for_count(&cache, "mytopic", 1).await, 1);
}

#[tokio::test]
async fn test_batching_cache_close_flushes_pending() {
    let inner = Arc::new(MemoryMessageCache::new());
    let cache = BatchingMessageCache::new(inner.clone(), 10, Duration::ZERO);
    cache
        .add_message(&message_at("mytopic", now(), "pending"))
        .await
        .unwrap();
    cache.close().await.unwrap();
    let stored = inner
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn test_batching_cache_close_keeps_every_batch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
        let inner = Arc::new(
            SqliteMessageCache::open(&path, "", Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let cache = BatchingMessageCache::new(inner, 7, Duration::from_millis(20));
        for i in 0..50 {
            cache
                .add_message(&message_at("mytopic", now(), &format!("message {i}")))
                .await
                .unwrap();
        }
        cache.close().await.unwrap();
        assert!(matches!(
            cache
                .add_message(&message_at("mytopic", now(), "too late"))
                .await,
            Err(Error::Storage(_))
        ));
    }

    let reopened = SqliteMessageCache::open(&path, "", Duration::from_secs(3600))
        .await
        .unwrap();
    let stored = reopened
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    assert_eq!(stored.len(), 50);
}

#[tokio::test]
async fn test_batching_cache_duplicate_drops_only_itself() {
    let inner = Arc::new(MemoryMessageCache::new());
    let existing = message_at("mytopic", now(), "existing");
    inner.add_message(&existing).await.unwrap();

    let cache = BatchingMessageCache::new(inner.clone(), 3, Duration::ZERO);
    let mut repeated = message_at("mytopic", now(), "repeated");
    repeated.id = existing.id.clone();
    for m in [
        message_at("mytopic", now(), "before"),
        repeated,
        message_at("mytopic", now(), "after"),
    ] {
        cache.add_message(&m).await.unwrap();
    }
    cache.close().await.unwrap();

    let stored = inner
        .messages("mytopic", &SinceMarker::All, false)
        .await
        .unwrap();
    let mut bodies: Vec<_> = stored.iter().map(|m| m.message.as_str()).collect();
    bodies.sort();
    assert_eq!(bodies, vec!["after", "before", "existing"]);
}

#[tokio::test]
async fn test_batching_cache_rejects_non_messages_immediately() {
    let inner = Arc::new(MemoryMessageCache::new());
    let cache = BatchingMessageCache::new(inner, 10, Duration::ZERO);
    assert!(matches!(
        cache.add_message(&Message::keepalive("mytopic")).await,
        Err(Error::UnexpectedMessageType)
    ));
    assert_eq!(cache.pending(), 0);
}

// Backend selection

#[tokio::test]
async fn test_create_message_cache_selects_backend() {
    let disabled = CacheSettings {
        duration_secs: 0,
        ..Default::default()
    };
    let nop = create_message_cache(&disabled).await.unwrap();
    nop.add_message(&message_at("t", now(), "x")).await.unwrap();
    assert!(nop.topics().await.unwrap().is_empty());

    let memory = create_message_cache(&CacheSettings::default()).await.unwrap();
    memory
        .add_message(&message_at("t", now(), "x"))
        .await
        .unwrap();
    assert_eq!(memory.topics().await.unwrap(), vec!["t".to_string()]);

    let dir = tempdir().unwrap();
    let sqlite = CacheSettings {
        file: dir.path().join("cache.db").to_string_lossy().to_string(),
        batch_size: 1,
        ..Default::default()
    };
    let batched = create_message_cache(&sqlite).await.unwrap();
    batched
        .add_message(&message_at("t", now(), "x"))
        .await
        .unwrap();
    assert_eq!(wait_for_count(batched.as_ref(), "t", 1).await, 1);
    batched.close().await.unwrap();
    assert!(dir.path().join("cache.db").exists());
}

// Attachment file store

#[tokio::test]
async fn test_file_cache_write_and_remove() {
    let dir = tempdir().unwrap();
    let cache = FileCache::new(dir.path().join("attachments"), 1000)
        .await
        .unwrap();
    let id = random_string(12);

    let size = cache.write(&id, b"hello world", &[]).await.unwrap();
    assert_eq!(size, 11);
    assert_eq!(cache.size(), 11);
    assert_eq!(cache.remaining(), 989);
    assert!(cache.path(&id).exists());
    assert_eq!(cache.read(&id).await.unwrap(), b"hello world");

    cache.remove(&[id.clone()]).await.unwrap();
    assert_eq!(cache.size(), 0);
    assert!(!cache.path(&id).exists());
    assert!(matches!(cache.read(&id).await, Err(Error::MessageNotFound)));
    assert!(matches!(
        cache.read("../etc/passwd").await,
        Err(Error::InvalidAttachmentId(_))
    ));
}

#[tokio::test]
async fn test_file_cache_rejects_invalid_id() {
    let dir = tempdir().unwrap();
    let cache = FileCache::new(dir.path(), 1000).await.unwrap();
    assert!(matches!(
        cache.write("../etc/passwd", b"x", &[]).await,
        Err(Error::InvalidAttachmentId(_))
    ));
    assert!(matches!(
        cache.remove(&["short".to_string()]).await,
        Err(Error::InvalidAttachmentId(_))
    ));
}

#[tokio::test]
async fn test_file_cache_limiters_roll_back_on_failure() {
    let dir = tempdir().unwrap();
    let cache = FileCache::new(dir.path(), 1000).await.unwrap();
    let roomy = FixedLimiter::new(100);
    let tight = FixedLimiter::new(5);
    let id = random_string(12);

    let result = cache.write(&id, b"too many bytes", &[&roomy, &tight]).await;
    assert!(matches!(result, Err(Error::LimitReached)));
    assert_eq!(roomy.value(), 0);
    assert_eq!(tight.value(), 0);
    assert!(!cache.path(&id).exists());
    assert_eq!(cache.size(), 0);

    cache.write(&id, b"fits", &[&roomy, &tight]).await.unwrap();
    assert_eq!(roomy.value(), 4);
}

#[tokio::test]
async fn test_file_cache_total_size_limit() {
    let dir = tempdir().unwrap();
    let cache = FileCache::new(dir.path(), 10).await.unwrap();
    cache
        .write(&random_string(12), b"12345678", &[])
        .await
        .unwrap();
    assert!(matches!(
        cache.write(&random_string(12), b"123", &[]).await,
        Err(Error::LimitReached)
    ));

    // Existing files count towards the total after a restart
    let reopened = FileCache::new(dir.path(), 10).await.unwrap();
    assert_eq!(reopened.size(), 8);
}

// PostgreSQL backend, only against a real server

async fn create_test_postgres() -> Option<PostgresMessageCache> {
    let url = std::env::var("NOTIFYCAST_TEST_DATABASE_URL").ok()?;
    Some(PostgresMessageCache::connect(&url, "", 2).await.unwrap())
}

#[tokio::test]
async fn test_postgres_add_and_replay() {
    let Some(cache) = create_test_postgres().await else {
        return;
    };
    let topic = random_string(10);
    let t = now();
    let m1 = message_at(&topic, t - 2, "first");
    let m2 = message_at(&topic, t - 1, "second");
    let scheduled = message_at(&topic, t + 3600, "later");
    cache
        .add_messages(&[m1.clone(), m2.clone(), scheduled.clone()])
        .await
        .unwrap();

    let all = cache
        .messages(&topic, &SinceMarker::All, true)
        .await
        .unwrap();
    assert_eq!(ids(&all), vec![m1.id.clone(), m2.id.clone(), scheduled.id.clone()]);

    let after_m1 = cache
        .messages(&topic, &SinceMarker::Id(m1.id.clone()), false)
        .await
        .unwrap();
    assert_eq!(ids(&after_m1), vec![m2.id]);

    assert!(matches!(
        cache.add_message(&Message::keepalive(&topic)).await,
        Err(Error::UnexpectedMessageType)
    ));
    assert!(matches!(
        cache.add_message(&m1).await,
        Err(Error::DuplicateMessage(id)) if id == m1.id
    ));
    assert_eq!(
        cache
            .messages(&topic, &SinceMarker::All, true)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn test_postgres_fields_survive_storage() {
    let Some(cache) = create_test_postgres().await else {
        return;
    };
    check_fields_survive_storage(&cache).await;
}
