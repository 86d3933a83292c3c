use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::broker::message::{Event, Message, SinceMarker};
use crate::persistence::MessageCache;
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    published: bool,
    attachment_deleted: bool,
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by insertion ordinal, which plays the role of the SQL row id.
    rows: BTreeMap<i64, StoredMessage>,
    next_row: i64,
    stats: i64,
}

impl State {
    fn row_id(&self, message_id: &str) -> Option<i64> {
        self.rows
            .iter()
            .find(|(_, stored)| stored.message.id == message_id)
            .map(|(row, _)| *row)
    }
}

/// Process-local message cache.
///
/// The no-op variant accepts every write and always reads back empty; it stands in
/// when caching is disabled.
#[derive(Debug, Default)]
pub struct MemoryMessageCache {
    state: RwLock<State>,
    nop: bool,
}

impl MemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nop() -> Self {
        Self {
            state: RwLock::new(State::default()),
            nop: true,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Storage("message cache lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Storage("message cache lock poisoned".to_string()))
    }

    fn ids_matching(&self, predicate: impl Fn(&StoredMessage) -> bool) -> Result<Vec<String>> {
        let state = self.read()?;
        Ok(state
            .rows
            .values()
            .filter(|stored| predicate(stored))
            .map(|stored| stored.message.id.clone())
            .collect())
    }

    fn attachment_bytes(&self, predicate: impl Fn(&Message) -> bool) -> Result<i64> {
        let now = Utc::now().timestamp();
        let state = self.read()?;
        Ok(state
            .rows
            .values()
            .filter(|stored| !stored.attachment_deleted && predicate(&stored.message))
            .filter_map(|stored| stored.message.attachment.as_ref())
            .filter(|a| a.expires >= now)
            .map(|a| a.size)
            .sum())
    }
}

/// Published rows first, then scheduled ones, each by time and insertion order.
fn sorted(mut rows: Vec<(i64, StoredMessage)>) -> Vec<Message> {
    rows.sort_by_key(|(row, stored)| (!stored.published, stored.message.time, *row));
    rows.into_iter().map(|(_, stored)| stored.message).collect()
}

#[async_trait]
impl MessageCache for MemoryMessageCache {
    async fn add_message(&self, message: &Message) -> Result<()> {
        self.add_messages(std::slice::from_ref(message)).await
    }

    async fn add_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.iter().any(|m| m.event != Event::Message) {
            return Err(Error::UnexpectedMessageType);
        }
        if self.nop {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut state = self.write()?;
        // Checked up front so a rejected batch leaves nothing behind
        let mut seen = HashSet::new();
        for m in messages {
            if !seen.insert(m.id.as_str()) || state.row_id(&m.id).is_some() {
                return Err(Error::DuplicateMessage(m.id.clone()));
            }
        }
        for m in messages {
            state.next_row += 1;
            let row = state.next_row;
            state.rows.insert(
                row,
                StoredMessage {
                    message: m.clone(),
                    published: m.time <= now,
                    attachment_deleted: false,
                },
            );
        }
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
        let state = self.read()?;
        let after_row = match since {
            SinceMarker::Id(id) => state.row_id(id),
            _ => None,
        };
        let since_time = since.time();
        let rows = state
            .rows
            .iter()
            .filter(|(_, stored)| stored.message.topic == topic)
            .filter(|(row, stored)| match after_row {
                Some(after) => **row > after || (include_scheduled && !stored.published),
                None => stored.message.time >= since_time,
            })
            .filter(|(_, stored)| include_scheduled || stored.published)
            .map(|(row, stored)| (*row, stored.clone()))
            .collect();
        Ok(sorted(rows))
    }

    async fn messages_due(&self) -> Result<Vec<Message>> {
        let now = Utc::now().timestamp();
        let state = self.read()?;
        let rows = state
            .rows
            .iter()
            .filter(|(_, stored)| !stored.published && stored.message.time <= now)
            .map(|(row, stored)| (*row, stored.clone()))
            .collect();
        Ok(sorted(rows))
    }

    async fn message(&self, id: &str) -> Result<Message> {
        let state = self.read()?;
        state
            .rows
            .values()
            .find(|stored| stored.message.id == id)
            .map(|stored| stored.message.clone())
            .ok_or(Error::MessageNotFound)
    }

    async fn mark_published(&self, message: &Message) -> Result<()> {
        let mut state = self.write()?;
        for stored in state.rows.values_mut() {
            if stored.message.id == message.id {
                stored.published = true;
            }
        }
        Ok(())
    }

    async fn messages_expired(&self) -> Result<Vec<String>> {
        let now = Utc::now().timestamp();
        self.ids_matching(|stored| stored.published && stored.message.expires <= now)
    }

    async fn delete_messages(&self, ids: &[String]) -> Result<()> {
        let mut state = self.write()?;
        state.rows.retain(|_, stored| !ids.contains(&stored.message.id));
        Ok(())
    }

    async fn expire_messages(&self, topics: &[String]) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut state = self.write()?;
        for stored in state.rows.values_mut() {
            if topics.contains(&stored.message.topic) {
                stored.message.expires = now;
            }
        }
        Ok(())
    }

    async fn attachments_expired(&self) -> Result<Vec<String>> {
        let now = Utc::now().timestamp();
        self.ids_matching(|stored| {
            !stored.attachment_deleted
                && stored
                    .message
                    .attachment
                    .as_ref()
                    .is_some_and(|a| a.expires > 0 && a.expires <= now)
        })
    }

    async fn mark_attachments_deleted(&self, ids: &[String]) -> Result<()> {
        let mut state = self.write()?;
        for stored in state.rows.values_mut() {
            if ids.contains(&stored.message.id) {
                stored.attachment_deleted = true;
            }
        }
        Ok(())
    }

    async fn attachment_bytes_used_by_sender(&self, sender: &str) -> Result<i64> {
        self.attachment_bytes(|m| {
            m.user.is_empty() && m.sender.is_some_and(|ip| ip.to_string() == sender)
        })
    }

    async fn attachment_bytes_used_by_user(&self, user_id: &str) -> Result<i64> {
        self.attachment_bytes(|m| m.user == user_id)
    }

    async fn message_counts(&self) -> Result<HashMap<String, i64>> {
        let state = self.read()?;
        let mut counts = HashMap::new();
        for stored in state.rows.values() {
            *counts.entry(stored.message.topic.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let counts = self.message_counts().await?;
        Ok(counts.into_keys().collect())
    }

    async fn stats(&self) -> Result<i64> {
        Ok(self.read()?.stats)
    }

    async fn update_stats(&self, messages: i64) -> Result<()> {
        if !self.nop {
            self.write()?.stats = messages;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
