//! SQLite message cache
//!
//! An embedded, single-writer store:
//! - the pool holds exactly one connection, so writes are serialized by SQLite itself
//! - startup queries (for example `PRAGMA journal_mode = WAL`) run once, before migrations
//! - the schema is versioned in `schemaVersion` and migrated forward on open; a database
//!   without that table is treated as version 0

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, error, info};

use crate::broker::message::{Message, SinceMarker};
use crate::persistence::MessageCache;
use crate::persistence::record::{MessageRecord, insert_error, read_message};
use crate::utils::error::{Error, Result};

pub const CURRENT_SCHEMA_VERSION: i64 = 12;

const CREATE_MESSAGES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mid TEXT NOT NULL,
        time INT NOT NULL,
        expires INT NOT NULL,
        topic TEXT NOT NULL,
        message TEXT NOT NULL,
        title TEXT NOT NULL,
        priority INT NOT NULL,
        tags TEXT NOT NULL,
        click TEXT NOT NULL,
        icon TEXT NOT NULL,
        actions TEXT NOT NULL,
        attachment_name TEXT NOT NULL,
        attachment_type TEXT NOT NULL,
        attachment_size INT NOT NULL,
        attachment_expires INT NOT NULL,
        attachment_url TEXT NOT NULL,
        attachment_deleted INT NOT NULL,
        sender TEXT NOT NULL,
        user TEXT NOT NULL,
        content_type TEXT NOT NULL,
        encoding TEXT NOT NULL,
        published INT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_mid ON messages (mid);
    CREATE INDEX IF NOT EXISTS idx_time ON messages (time);
    CREATE INDEX IF NOT EXISTS idx_topic ON messages (topic);
    CREATE INDEX IF NOT EXISTS idx_expires ON messages (expires);
    CREATE INDEX IF NOT EXISTS idx_attachment_expires ON messages (attachment_expires);
    CREATE TABLE IF NOT EXISTS stats (
        key TEXT PRIMARY KEY,
        value INT
    );
    INSERT OR IGNORE INTO stats (key, value) VALUES ('messages', 0);
"#;

const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schemaVersion (
        id INT PRIMARY KEY,
        version INT NOT NULL
    );
"#;
const INSERT_SCHEMA_VERSION: &str = "INSERT INTO schemaVersion VALUES (1, ?)";
const UPDATE_SCHEMA_VERSION: &str = "UPDATE schemaVersion SET version = ? WHERE id = 1";
const SELECT_SCHEMA_VERSION: &str = "SELECT version FROM schemaVersion WHERE id = 1";

const SELECT_MESSAGES_COUNT: &str = "SELECT COUNT(*) FROM messages";

const INSERT_MESSAGE: &str = r#"
    INSERT INTO messages (mid, time, expires, topic, message, title, priority, tags, click, icon, actions, attachment_name, attachment_type, attachment_size, attachment_expires, attachment_url, attachment_deleted, sender, user, content_type, encoding, published)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)
"#;

const COLUMNS: &str = "mid, time, expires, topic, message, title, priority, tags, click, icon, actions, attachment_name, attachment_type, attachment_size, attachment_expires, attachment_url, sender, user, content_type, encoding";

const DELETE_MESSAGE: &str = "DELETE FROM messages WHERE mid = ?";
const UPDATE_MESSAGES_FOR_TOPIC_EXPIRY: &str = "UPDATE messages SET expires = ? WHERE topic = ?";
// Topic-agnostic so an ID resolves to the same position whichever topic is replayed.
const SELECT_ROW_ID_FROM_MESSAGE_ID: &str = "SELECT id FROM messages WHERE mid = ?";
const UPDATE_MESSAGE_PUBLISHED: &str = "UPDATE messages SET published = 1 WHERE mid = ?";
const SELECT_MESSAGES_EXPIRED: &str =
    "SELECT mid FROM messages WHERE expires <= ? AND published = 1";
const SELECT_MESSAGE_COUNT_PER_TOPIC: &str =
    "SELECT topic, COUNT(*) AS count FROM messages GROUP BY topic";
const SELECT_TOPICS: &str = "SELECT topic FROM messages GROUP BY topic";
const UPDATE_ATTACHMENT_DELETED: &str =
    "UPDATE messages SET attachment_deleted = 1 WHERE mid = ?";
const SELECT_ATTACHMENTS_EXPIRED: &str = "SELECT mid FROM messages WHERE attachment_expires > 0 AND attachment_expires <= ? AND attachment_deleted = 0";
const SELECT_ATTACHMENTS_SIZE_BY_SENDER: &str = "SELECT IFNULL(SUM(attachment_size), 0) FROM messages WHERE user = '' AND sender = ? AND attachment_expires >= ? AND attachment_deleted = 0";
const SELECT_ATTACHMENTS_SIZE_BY_USER: &str = "SELECT IFNULL(SUM(attachment_size), 0) FROM messages WHERE user = ? AND attachment_expires >= ? AND attachment_deleted = 0";
const SELECT_STATS: &str = "SELECT value FROM stats WHERE key = 'messages'";
const UPDATE_STATS: &str = "UPDATE stats SET value = ? WHERE key = 'messages'";

/// Schema changes applied when leaving version `n`, indexed by `n`.
const MIGRATIONS: [&str; 12] = [
    // 0 -> 1
    r#"
    ALTER TABLE messages ADD COLUMN title TEXT NOT NULL DEFAULT('');
    ALTER TABLE messages ADD COLUMN priority INT NOT NULL DEFAULT(0);
    ALTER TABLE messages ADD COLUMN tags TEXT NOT NULL DEFAULT('');
    "#,
    // 1 -> 2
    "ALTER TABLE messages ADD COLUMN published INT NOT NULL DEFAULT(1);",
    // 2 -> 3
    r#"
    ALTER TABLE messages ADD COLUMN click TEXT NOT NULL DEFAULT('');
    ALTER TABLE messages ADD COLUMN attachment_name TEXT NOT NULL DEFAULT('');
    ALTER TABLE messages ADD COLUMN attachment_type TEXT NOT NULL DEFAULT('');
    ALTER TABLE messages ADD COLUMN attachment_size INT NOT NULL DEFAULT('0');
    ALTER TABLE messages ADD COLUMN attachment_expires INT NOT NULL DEFAULT('0');
    ALTER TABLE messages ADD COLUMN attachment_owner TEXT NOT NULL DEFAULT('');
    ALTER TABLE messages ADD COLUMN attachment_url TEXT NOT NULL DEFAULT('');
    "#,
    // 3 -> 4
    "ALTER TABLE messages ADD COLUMN encoding TEXT NOT NULL DEFAULT('');",
    // 4 -> 5: the text id becomes `mid` behind an integer row id
    r#"
    CREATE TABLE IF NOT EXISTS messages_new (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mid TEXT NOT NULL,
        time INT NOT NULL,
        topic TEXT NOT NULL,
        message TEXT NOT NULL,
        title TEXT NOT NULL,
        priority INT NOT NULL,
        tags TEXT NOT NULL,
        click TEXT NOT NULL,
        attachment_name TEXT NOT NULL,
        attachment_type TEXT NOT NULL,
        attachment_size INT NOT NULL,
        attachment_expires INT NOT NULL,
        attachment_url TEXT NOT NULL,
        attachment_owner TEXT NOT NULL,
        encoding TEXT NOT NULL,
        published INT NOT NULL
    );
    INSERT INTO messages_new (
        mid, time, topic, message, title, priority, tags, click, attachment_name, attachment_type,
        attachment_size, attachment_expires, attachment_url, attachment_owner, encoding, published)
    SELECT
        id, time, topic, message, title, priority, tags, click, attachment_name, attachment_type,
        attachment_size, attachment_expires, attachment_url, attachment_owner, encoding, published
    FROM messages
    ORDER BY time;
    DROP TABLE messages;
    ALTER TABLE messages_new RENAME TO messages;
    CREATE INDEX IF NOT EXISTS idx_mid ON messages (mid);
    CREATE INDEX IF NOT EXISTS idx_topic ON messages (topic);
    "#,
    // 5 -> 6
    "ALTER TABLE messages ADD COLUMN actions TEXT NOT NULL DEFAULT('');",
    // 6 -> 7
    "ALTER TABLE messages RENAME COLUMN attachment_owner TO sender;",
    // 7 -> 8
    "ALTER TABLE messages ADD COLUMN icon TEXT NOT NULL DEFAULT('');",
    // 8 -> 9
    "CREATE INDEX IF NOT EXISTS idx_time ON messages (time);",
    // 9 -> 10, followed by the expiry backfill
    r#"
    ALTER TABLE messages ADD COLUMN user TEXT NOT NULL DEFAULT('');
    ALTER TABLE messages ADD COLUMN attachment_deleted INT NOT NULL DEFAULT('0');
    ALTER TABLE messages ADD COLUMN expires INT NOT NULL DEFAULT('0');
    CREATE INDEX IF NOT EXISTS idx_expires ON messages (expires);
    CREATE INDEX IF NOT EXISTS idx_attachment_expires ON messages (attachment_expires);
    "#,
    // 10 -> 11
    r#"
    ALTER TABLE messages ADD COLUMN content_type TEXT NOT NULL DEFAULT('');
    CREATE TABLE IF NOT EXISTS stats (
        key TEXT PRIMARY KEY,
        value INT
    );
    INSERT OR IGNORE INTO stats (key, value) VALUES ('messages', 0);
    "#,
    // 11 -> 12: message IDs become unique, keeping the oldest row of each
    r#"
    DELETE FROM messages WHERE id NOT IN (SELECT MIN(id) FROM messages GROUP BY mid);
    DROP INDEX IF EXISTS idx_mid;
    CREATE UNIQUE INDEX idx_mid ON messages (mid);
    "#,
];

const MIGRATE_9_TO_10_UPDATE_EXPIRY: &str = "UPDATE messages SET expires = time + ?";

/// Message cache backed by a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteMessageCache {
    pool: SqlitePool,
}

impl SqliteMessageCache {
    /// Opens (or creates) the database at `path` and migrates it to the current schema.
    ///
    /// `cache_duration` backfills `expires` for rows written before expiry was stored
    /// per message.
    pub async fn open(
        path: impl AsRef<Path>,
        startup_queries: &str,
        cache_duration: Duration,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        setup_db(&pool, startup_queries, cache_duration).await?;
        Ok(Self { pool })
    }

    /// Current schema version of the underlying database.
    pub async fn schema_version(&self) -> Result<i64> {
        let row = sqlx::query(SELECT_SCHEMA_VERSION)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn query_messages(&self, sql: &str, binds: &[i64], topic: Option<&str>) -> Result<Vec<Message>> {
        let mut query = sqlx::query(sql);
        if let Some(topic) = topic {
            query = query.bind(topic);
        }
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(read_message).collect()
    }

    async fn query_ids(&self, sql: &str, now: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get("mid").map_err(Error::from))
            .collect()
    }

    async fn update_each(&self, sql: &str, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(sql).bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn setup_db(pool: &SqlitePool, startup_queries: &str, cache_duration: Duration) -> Result<()> {
    if !startup_queries.trim().is_empty() {
        sqlx::raw_sql(startup_queries).execute(pool).await?;
    }

    // No messages table: this is a new database
    if sqlx::query(SELECT_MESSAGES_COUNT).fetch_one(pool).await.is_err() {
        return setup_new_db(pool).await;
    }

    let version = match sqlx::query(SELECT_SCHEMA_VERSION).fetch_optional(pool).await {
        Ok(Some(row)) => row.try_get::<i64, _>(0)?,
        Ok(None) => return Err(Error::CorruptSchema),
        Err(_) => 0,
    };
    if version > CURRENT_SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found: version,
            current: CURRENT_SCHEMA_VERSION,
        });
    }
    for from in version..CURRENT_SCHEMA_VERSION {
        migrate_from(pool, from, cache_duration).await?;
    }
    Ok(())
}

async fn setup_new_db(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::raw_sql(CREATE_MESSAGES_TABLE).execute(&mut *tx).await?;
    sqlx::raw_sql(CREATE_SCHEMA_VERSION_TABLE)
        .execute(&mut *tx)
        .await?;
    sqlx::query(INSERT_SCHEMA_VERSION)
        .bind(CURRENT_SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    debug!(version = CURRENT_SCHEMA_VERSION, "Created new cache database");
    Ok(())
}

async fn migrate_from(pool: &SqlitePool, from: i64, cache_duration: Duration) -> Result<()> {
    let to = from + 1;
    info!(from, to, "Migrating cache database schema");
    let statements = usize::try_from(from)
        .ok()
        .and_then(|i| MIGRATIONS.get(i))
        .ok_or(Error::CorruptSchema)?;

    let mut tx: Transaction<'_, Sqlite> = pool.begin().await?;
    sqlx::raw_sql(statements).execute(&mut *tx).await?;
    match from {
        0 => {
            sqlx::raw_sql(CREATE_SCHEMA_VERSION_TABLE)
                .execute(&mut *tx)
                .await?;
            sqlx::query(INSERT_SCHEMA_VERSION)
                .bind(to)
                .execute(&mut *tx)
                .await?;
        }
        9 => {
            let secs = i64::try_from(cache_duration.as_secs()).unwrap_or(i64::MAX);
            sqlx::query(MIGRATE_9_TO_10_UPDATE_EXPIRY)
                .bind(secs)
                .execute(&mut *tx)
                .await?;
        }
        _ => {}
    }
    if from != 0 {
        sqlx::query(UPDATE_SCHEMA_VERSION)
            .bind(to)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl MessageCache for SqliteMessageCache {
    async fn add_message(&self, message: &Message) -> Result<()> {
        self.add_messages(std::slice::from_ref(message)).await
    }

    async fn add_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let started = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;
        for m in messages {
            let r = MessageRecord::from_message(m, now)?;
            sqlx::query(INSERT_MESSAGE)
                .bind(r.mid)
                .bind(r.time)
                .bind(r.expires)
                .bind(r.topic)
                .bind(r.message)
                .bind(r.title)
                .bind(r.priority)
                .bind(r.tags)
                .bind(r.click)
                .bind(r.icon)
                .bind(r.actions)
                .bind(r.attachment_name)
                .bind(r.attachment_type)
                .bind(r.attachment_size)
                .bind(r.attachment_expires)
                .bind(r.attachment_url)
                .bind(r.sender)
                .bind(r.user)
                .bind(r.content_type)
                .bind(r.encoding)
                .bind(r.published)
                .execute(&mut *tx)
                .await
                .map_err(|e| insert_error(e, &m.id))?;
        }
        if let Err(e) = tx.commit().await {
            error!(count = messages.len(), error = %e, "Writing messages failed");
            return Err(e.into());
        }
        debug!(count = messages.len(), elapsed = ?started.elapsed(), "Wrote messages");
        Ok(())
    }

    async fn messages(
        &self,
        topic: &str,
        since: &SinceMarker,
        include_scheduled: bool,
    ) -> Result<Vec<Message>> {
        if since.is_none() {
            return Ok(Vec::new());
        }
        if let SinceMarker::Id(id) = since {
            let row = sqlx::query(SELECT_ROW_ID_FROM_MESSAGE_ID)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                let row_id: i64 = row.try_get("id")?;
                let filter = if include_scheduled {
                    "(id > ? OR published = 0)"
                } else {
                    "id > ? AND published = 1"
                };
                let sql = format!(
                    "SELECT {COLUMNS} FROM messages WHERE topic = ? AND {filter} ORDER BY published DESC, time, id"
                );
                return self.query_messages(&sql, &[row_id], Some(topic)).await;
            }
        }
        let filter = if include_scheduled {
            ""
        } else {
            " AND published = 1"
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM messages WHERE topic = ? AND time >= ?{filter} ORDER BY published DESC, time, id"
        );
        self.query_messages(&sql, &[since.time()], Some(topic)).await
    }

    async fn messages_due(&self) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM messages WHERE time <= ? AND published = 0 ORDER BY time, id"
        );
        self.query_messages(&sql, &[Utc::now().timestamp()], None)
            .await
    }

    async fn message(&self, id: &str) -> Result<Message> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE mid = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::MessageNotFound)?;
        read_message(&row)
    }

    async fn mark_published(&self, message: &Message) -> Result<()> {
        sqlx::query(UPDATE_MESSAGE_PUBLISHED)
            .bind(&message.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn messages_expired(&self) -> Result<Vec<String>> {
        self.query_ids(SELECT_MESSAGES_EXPIRED, Utc::now().timestamp())
            .await
    }

    async fn delete_messages(&self, ids: &[String]) -> Result<()> {
        self.update_each(DELETE_MESSAGE, ids).await
    }

    async fn expire_messages(&self, topics: &[String]) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for topic in topics {
            sqlx::query(UPDATE_MESSAGES_FOR_TOPIC_EXPIRY)
                .bind(now)
                .bind(topic)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn attachments_expired(&self) -> Result<Vec<String>> {
        self.query_ids(SELECT_ATTACHMENTS_EXPIRED, Utc::now().timestamp())
            .await
    }

    async fn mark_attachments_deleted(&self, ids: &[String]) -> Result<()> {
        self.update_each(UPDATE_ATTACHMENT_DELETED, ids).await
    }

    async fn attachment_bytes_used_by_sender(&self, sender: &str) -> Result<i64> {
        let row = sqlx::query(SELECT_ATTACHMENTS_SIZE_BY_SENDER)
            .bind(sender)
            .bind(Utc::now().timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn attachment_bytes_used_by_user(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query(SELECT_ATTACHMENTS_SIZE_BY_USER)
            .bind(user_id)
            .bind(Utc::now().timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn message_counts(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(SELECT_MESSAGE_COUNT_PER_TOPIC)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("topic")?, row.try_get("count")?)))
            .collect()
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(SELECT_TOPICS).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get("topic").map_err(Error::from))
            .collect()
    }

    async fn stats(&self) -> Result<i64> {
        let row = sqlx::query(SELECT_STATS).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<i64>, _>(0)?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn update_stats(&self, messages: i64) -> Result<()> {
        sqlx::query(UPDATE_STATS)
            .bind(messages)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
