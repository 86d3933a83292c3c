use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, error, info, instrument};

use crate::broker::message::{Message, SinceMarker};
use crate::persistence::MessageCache;
use crate::persistence::record::{MessageRecord, insert_error, read_message};
use crate::utils::error::{Error, Result};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

const CREATE_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        mid TEXT NOT NULL,
        time BIGINT NOT NULL,
        expires BIGINT NOT NULL,
        topic TEXT NOT NULL,
        message TEXT NOT NULL,
        title TEXT NOT NULL,
        priority BIGINT NOT NULL,
        tags TEXT NOT NULL,
        click TEXT NOT NULL,
        icon TEXT NOT NULL,
        actions TEXT NOT NULL,
        attachment_name TEXT NOT NULL,
        attachment_type TEXT NOT NULL,
        attachment_size BIGINT NOT NULL,
        attachment_expires BIGINT NOT NULL,
        attachment_url TEXT NOT NULL,
        attachment_deleted BOOLEAN NOT NULL,
        sender TEXT NOT NULL,
        "user" TEXT NOT NULL,
        content_type TEXT NOT NULL,
        encoding TEXT NOT NULL,
        published BOOLEAN NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_mid ON messages (mid);
    CREATE INDEX IF NOT EXISTS idx_time ON messages (time);
    CREATE INDEX IF NOT EXISTS idx_topic ON messages (topic);
    CREATE INDEX IF NOT EXISTS idx_expires ON messages (expires);
    CREATE INDEX IF NOT EXISTS idx_sender ON messages (sender);
    CREATE INDEX IF NOT EXISTS idx_user ON messages ("user");
    CREATE INDEX IF NOT EXISTS idx_attachment_expires ON messages (attachment_expires);
    CREATE TABLE IF NOT EXISTS stats (
        key TEXT PRIMARY KEY,
        value BIGINT
    );
    INSERT INTO stats (key, value) VALUES ('messages', 0) ON CONFLICT (key) DO NOTHING;
    CREATE TABLE IF NOT EXISTS schema_version (
        id INT PRIMARY KEY,
        version BIGINT NOT NULL
    );
"#;

const INSERT_SCHEMA_VERSION: &str =
    "INSERT INTO schema_version (id, version) VALUES (1, $1) ON CONFLICT (id) DO NOTHING";
const SELECT_SCHEMA_VERSION: &str = "SELECT version FROM schema_version WHERE id = 1";
const UPDATE_SCHEMA_VERSION: &str = "UPDATE schema_version SET version = $1 WHERE id = 1";
const MIGRATE_1_TO_2: &str = r#"
    DELETE FROM messages WHERE id NOT IN (SELECT MIN(id) FROM messages GROUP BY mid);
    DROP INDEX IF EXISTS idx_mid;
    CREATE UNIQUE INDEX idx_mid ON messages (mid);
"#;
const SELECT_MESSAGES_COUNT: &str = "SELECT COUNT(*) FROM messages";

const INSERT_MESSAGE: &str = r#"
    INSERT INTO messages (mid, time, expires, topic, message, title, priority, tags, click, icon, actions, attachment_name, attachment_type, attachment_size, attachment_expires, attachment_url, attachment_deleted, sender, "user", content_type, encoding, published)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, FALSE, $17, $18, $19, $20, $21)
"#;

const COLUMNS: &str = r#"mid, time, expires, topic, message, title, priority, tags, click, icon, actions, attachment_name, attachment_type, attachment_size, attachment_expires, attachment_url, sender, "user", content_type, encoding"#;

const DELETE_MESSAGE: &str = "DELETE FROM messages WHERE mid = $1";
const UPDATE_MESSAGES_FOR_TOPIC_EXPIRY: &str = "UPDATE messages SET expires = $1 WHERE topic = $2";
// Deliberately not scoped to a topic.
const SELECT_ROW_ID_FROM_MESSAGE_ID: &str = "SELECT id FROM messages WHERE mid = $1";
const UPDATE_MESSAGE_PUBLISHED: &str = "UPDATE messages SET published = TRUE WHERE mid = $1";
const SELECT_MESSAGES_EXPIRED: &str =
    "SELECT mid FROM messages WHERE expires <= $1 AND published = TRUE";
const SELECT_MESSAGE_COUNT_PER_TOPIC: &str =
    "SELECT topic, COUNT(*) AS count FROM messages GROUP BY topic";
const SELECT_TOPICS: &str = "SELECT topic FROM messages GROUP BY topic";
const UPDATE_ATTACHMENT_DELETED: &str =
    "UPDATE messages SET attachment_deleted = TRUE WHERE mid = $1";
const SELECT_ATTACHMENTS_EXPIRED: &str = "SELECT mid FROM messages WHERE attachment_expires > 0 AND attachment_expires <= $1 AND attachment_deleted = FALSE";
const SELECT_ATTACHMENTS_SIZE_BY_SENDER: &str = r#"SELECT COALESCE(SUM(attachment_size), 0)::BIGINT FROM messages WHERE "user" = '' AND sender = $1 AND attachment_expires >= $2 AND attachment_deleted = FALSE"#;
const SELECT_ATTACHMENTS_SIZE_BY_USER: &str = r#"SELECT COALESCE(SUM(attachment_size), 0)::BIGINT FROM messages WHERE "user" = $1 AND attachment_expires >= $2 AND attachment_deleted = FALSE"#;
const SELECT_STATS: &str = "SELECT value FROM stats WHERE key = 'messages'";
const UPDATE_STATS: &str = "UPDATE stats SET value = $1 WHERE key = 'messages'";

/// Message cache backed by a PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PostgresMessageCache {
    pool: PgPool,
}

impl PostgresMessageCache {
    pub async fn connect(
        database_url: &str,
        startup_queries: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Self::from_pool(pool, startup_queries).await
    }

    /// Wraps an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: PgPool, startup_queries: &str) -> Result<Self> {
        if !startup_queries.trim().is_empty() {
            sqlx::raw_sql(startup_queries).execute(&pool).await?;
        }
        if sqlx::query(SELECT_MESSAGES_COUNT).fetch_one(&pool).await.is_err() {
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(CREATE_TABLES).execute(&mut *tx).await?;
            sqlx::query(INSERT_SCHEMA_VERSION)
                .bind(CURRENT_SCHEMA_VERSION)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version = CURRENT_SCHEMA_VERSION, "Created message cache schema");
        } else {
            let version: i64 = sqlx::query(SELECT_SCHEMA_VERSION)
                .fetch_optional(&pool)
                .await?
                .ok_or(Error::CorruptSchema)?
                .try_get(0)?;
            if version > CURRENT_SCHEMA_VERSION {
                return Err(Error::SchemaTooNew {
                    found: version,
                    current: CURRENT_SCHEMA_VERSION,
                });
            }
            if version < 2 {
                info!(from = version, to = 2, "Migrating message cache schema");
                let mut tx = pool.begin().await?;
                sqlx::raw_sql(MIGRATE_1_TO_2).execute(&mut *tx).await?;
                sqlx::query(UPDATE_SCHEMA_VERSION)
                    .bind(2_i64)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
        }
        Ok(Self { pool })
    }

    async fn select(&self, sql: &str, topic: Option<&str>, value: i64) -> Result<Vec<Message>> {
        let mut query = sqlx::query(sql);
        if let Some(topic) = topic {
            query = query.bind(topic);
        }
        let rows = query.bind(value).fetch_all(&self.pool).await?;
        rows.iter().map(read_message).collect()
    }

    async fn select_ids(&self, sql: &str, now: i64) -> Result<Vec<String>> {
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

#[async_trait]
impl MessageCache for PostgresMessageCache {
    async fn add_message(&self, message: &Message) -> Result<()> {
        self.add_messages(std::slice::from_ref(message)).await
    }

    #[instrument(skip(self, messages), fields(count = messages.len()), err)]
    async fn add_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
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
            error!(error = %e, "Writing messages failed");
            return Err(e.into());
        }
        debug!("Wrote messages");
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
                    "(id > $2 OR published = FALSE)"
                } else {
                    "id > $2 AND published = TRUE"
                };
                let sql = format!(
                    "SELECT {COLUMNS} FROM messages WHERE topic = $1 AND {filter} ORDER BY published DESC, time, id"
                );
                return self.select(&sql, Some(topic), row_id).await;
            }
        }
        let filter = if include_scheduled {
            ""
        } else {
            " AND published = TRUE"
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM messages WHERE topic = $1 AND time >= $2{filter} ORDER BY published DESC, time, id"
        );
        self.select(&sql, Some(topic), since.time()).await
    }

    async fn messages_due(&self) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM messages WHERE time <= $1 AND published = FALSE ORDER BY time, id"
        );
        self.select(&sql, None, Utc::now().timestamp()).await
    }

    async fn message(&self, id: &str) -> Result<Message> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE mid = $1");
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
        self.select_ids(SELECT_MESSAGES_EXPIRED, Utc::now().timestamp())
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
        self.select_ids(SELECT_ATTACHMENTS_EXPIRED, Utc::now().timestamp())
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
