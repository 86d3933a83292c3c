//! The `persistence` module stores messages for replay, scheduled delivery and
//! attachment accounting.
//!
//! Every backend implements [`MessageCache`], so callers never depend on a concrete
//! store:
//!
//! - [`memory::MemoryMessageCache`]: process-local, lost on restart. Also provides the
//!   no-op store used when caching is disabled.
//! - [`sqlite_store::SqliteMessageCache`]: embedded single-writer file with schema
//!   migrations.
//! - [`postgres_store::PostgresMessageCache`]: networked server behind a connection pool.
//! - [`batching::BatchingMessageCache`]: optional write-batching stage in front of any of
//!   the above.
//!
//! Attachment files live next to the cache in [`file_cache::FileCache`].

pub mod batching;
pub mod file_cache;
pub mod memory;
pub mod postgres_store;
pub mod sqlite_store;

mod record;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::broker::message::{Message, SinceMarker};
use crate::config::CacheSettings;
use crate::utils::error::Result;

use batching::BatchingMessageCache;
use memory::MemoryMessageCache;
use postgres_store::PostgresMessageCache;
use sqlite_store::SqliteMessageCache;

/// Durable message store shared by the server, the delayed sender and the manager loop.
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Stores one message. Fails with `UnexpectedMessageType` for anything but a
    /// `message` event and with `DuplicateMessage` if the ID is already stored.
    /// `published` is derived from `time <= now`.
    async fn add_message(&self, message: &Message) -> Result<()>;

    /// Stores a batch in one transaction; any failure rolls back the whole batch.
    async fn add_messages(&self, messages: &[Message]) -> Result<()>;

    /// Replays a topic. Published rows come first, then scheduled rows when
    /// `include_scheduled` is set, each ordered by time.
    async fn messages(
        &self,
        topic: &str,
        since: &SinceMarker,
        include_scheduled: bool,
    ) -> Result<Vec<Message>>;

    /// Unpublished messages whose time has come.
    async fn messages_due(&self) -> Result<Vec<Message>>;

    /// Looks up one message by ID.
    async fn message(&self, id: &str) -> Result<Message>;

    async fn mark_published(&self, message: &Message) -> Result<()>;

    /// IDs of published messages whose `expires` has passed.
    async fn messages_expired(&self) -> Result<Vec<String>>;

    async fn delete_messages(&self, ids: &[String]) -> Result<()>;

    /// Expires every message of the given topics now.
    async fn expire_messages(&self, topics: &[String]) -> Result<()>;

    /// IDs of messages whose attachment expired and has not been deleted yet.
    async fn attachments_expired(&self) -> Result<Vec<String>>;

    async fn mark_attachments_deleted(&self, ids: &[String]) -> Result<()>;

    /// Bytes of live attachments sent anonymously from `sender`.
    async fn attachment_bytes_used_by_sender(&self, sender: &str) -> Result<i64>;

    /// Bytes of live attachments sent by `user_id`.
    async fn attachment_bytes_used_by_user(&self, user_id: &str) -> Result<i64>;

    async fn message_counts(&self) -> Result<HashMap<String, i64>>;

    /// Names of all topics with at least one cached message.
    async fn topics(&self) -> Result<Vec<String>>;

    /// Lifetime number of published messages.
    async fn stats(&self) -> Result<i64>;

    async fn update_stats(&self, messages: i64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds the message cache selected by `settings`.
///
/// A zero cache duration disables caching, a database URL selects PostgreSQL, a file
/// selects SQLite, and the in-memory store is used otherwise. A non-zero batch size or
/// timeout wraps the store in the batching stage.
pub async fn create_message_cache(settings: &CacheSettings) -> Result<Arc<dyn MessageCache>> {
    let cache: Arc<dyn MessageCache> = if settings.duration().is_zero() {
        info!("Message caching disabled");
        Arc::new(MemoryMessageCache::nop())
    } else if !settings.database_url.is_empty() {
        info!("Using PostgreSQL message cache");
        Arc::new(
            PostgresMessageCache::connect(
                &settings.database_url,
                &settings.startup_queries,
                settings.max_connections,
            )
            .await?,
        )
    } else if !settings.file.is_empty() {
        info!(file = %settings.file, "Using SQLite message cache");
        Arc::new(
            SqliteMessageCache::open(
                &settings.file,
                &settings.startup_queries,
                settings.duration(),
            )
            .await?,
        )
    } else {
        info!("Using in-memory message cache");
        Arc::new(MemoryMessageCache::new())
    };

    let batch_timeout = Duration::from_millis(settings.batch_timeout_ms);
    if settings.batch_size > 0 || !batch_timeout.is_zero() {
        info!(
            batch_size = settings.batch_size,
            batch_timeout_ms = settings.batch_timeout_ms,
            "Batching message cache writes"
        );
        return Ok(Arc::new(BatchingMessageCache::new(
            cache,
            settings.batch_size,
            batch_timeout,
        )));
    }
    Ok(cache)
}

#[cfg(test)]
mod tests;
