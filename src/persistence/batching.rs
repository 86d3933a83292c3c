use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broker::message::{Event, Message, SinceMarker};
use crate::persistence::MessageCache;
use crate::utils::batching_queue::BatchingQueue;
use crate::utils::error::{Error, Result};

/// Write-batching stage in front of another [`MessageCache`].
///
/// `add_message` only enqueues; a background task writes each emitted batch with one
/// `add_messages` call. Batches not yet flushed are lost if the process dies. Reads
/// and every other operation go straight to the inner store.
///
/// `close` stops the queue, lets the writer finish every batch already emitted, writes
/// the remainder and only then closes the inner store.
pub struct BatchingMessageCache {
    inner: Arc<dyn MessageCache>,
    queue: BatchingQueue<Message>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingMessageCache {
    /// Must be called from within a tokio runtime.
    pub fn new(inner: Arc<dyn MessageCache>, batch_size: usize, timeout: Duration) -> Self {
        let (queue, mut batches) = BatchingQueue::new(batch_size, timeout);
        let target = inner.clone();
        let writer = tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                if let Err(e) = write_batch(target.as_ref(), &batch).await {
                    error!(count = batch.len(), error = %e, "Cannot write message batch");
                }
            }
            debug!("Message batch writer stopped");
        });
        Self {
            inner,
            queue,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Number of messages waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[async_trait]
impl MessageCache for BatchingMessageCache {
    async fn add_message(&self, message: &Message) -> Result<()> {
        if message.event != Event::Message {
            return Err(Error::UnexpectedMessageType);
        }
        self.queue.enqueue(message.clone())
    }

    async fn add_messages(&self, messages: &[Message]) -> Result<()> {
        self.inner.add_messages(messages).await
    }

    async fn messages(
        &self,
        topic: &str,
        since: &SinceMarker,
        include_scheduled: bool,
    ) -> Result<Vec<Message>> {
        self.inner.messages(topic, since, include_scheduled).await
    }

    async fn messages_due(&self) -> Result<Vec<Message>> {
        self.inner.messages_due().await
    }

    async fn message(&self, id: &str) -> Result<Message> {
        self.inner.message(id).await
    }

    async fn mark_published(&self, message: &Message) -> Result<()> {
        self.inner.mark_published(message).await
    }

    async fn messages_expired(&self) -> Result<Vec<String>> {
        self.inner.messages_expired().await
    }

    async fn delete_messages(&self, ids: &[String]) -> Result<()> {
        self.inner.delete_messages(ids).await
    }

    async fn expire_messages(&self, topics: &[String]) -> Result<()> {
        self.inner.expire_messages(topics).await
    }

    async fn attachments_expired(&self) -> Result<Vec<String>> {
        self.inner.attachments_expired().await
    }

    async fn mark_attachments_deleted(&self, ids: &[String]) -> Result<()> {
        self.inner.mark_attachments_deleted(ids).await
    }

    async fn attachment_bytes_used_by_sender(&self, sender: &str) -> Result<i64> {
        self.inner.attachment_bytes_used_by_sender(sender).await
    }

    async fn attachment_bytes_used_by_user(&self, user_id: &str) -> Result<i64> {
        self.inner.attachment_bytes_used_by_user(user_id).await
    }

    async fn message_counts(&self) -> Result<HashMap<String, i64>> {
        self.inner.message_counts().await
    }

    async fn topics(&self) -> Result<Vec<String>> {
        self.inner.topics().await
    }

    async fn stats(&self) -> Result<i64> {
        self.inner.stats().await
    }

    async fn update_stats(&self, messages: i64) -> Result<()> {
        self.inner.update_stats(messages).await
    }

    async fn close(&self) -> Result<()> {
        let pending = self.queue.close();
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!(error = %e, "Message batch writer failed");
            }
        }
        if !pending.is_empty() {
            write_batch(self.inner.as_ref(), &pending).await?;
        }
        self.inner.close().await
    }
}

/// Writes a batch in one call. A repeated ID fails the whole transaction, so the batch
/// is then retried message by message and only the duplicates are dropped.
async fn write_batch(target: &dyn MessageCache, batch: &[Message]) -> Result<()> {
    match target.add_messages(batch).await {
        Err(Error::DuplicateMessage(id)) => {
            warn!(count = batch.len(), message_id = %id, "Batch holds a duplicate, writing one by one");
            for message in batch {
                match target.add_message(message).await {
                    Ok(()) => {}
                    Err(Error::DuplicateMessage(id)) => {
                        debug!(message_id = %id, "Dropping duplicate message");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        result => result,
    }
}
