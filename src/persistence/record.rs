//! Column mapping shared by the SQL backends.

use std::net::IpAddr;

use sqlx::{ColumnIndex, Decode, Row, Type};

use crate::broker::message::{Action, Attachment, Event, Message};
use crate::utils::error::{Error, Result};

/// Flattened form of a [`Message`], in the column order of the insert statements.
pub(crate) struct MessageRecord {
    pub mid: String,
    pub time: i64,
    pub expires: i64,
    pub topic: String,
    pub message: String,
    pub title: String,
    pub priority: i64,
    pub tags: String,
    pub click: String,
    pub icon: String,
    pub actions: String,
    pub attachment_name: String,
    pub attachment_type: String,
    pub attachment_size: i64,
    pub attachment_expires: i64,
    pub attachment_url: String,
    pub sender: String,
    pub user: String,
    pub content_type: String,
    pub encoding: String,
    pub published: bool,
}

impl MessageRecord {
    pub fn from_message(m: &Message, now: i64) -> Result<Self> {
        if m.event != Event::Message {
            return Err(Error::UnexpectedMessageType);
        }
        let actions = if m.actions.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&m.actions)?
        };
        let attachment = m.attachment.clone().unwrap_or_default();
        Ok(Self {
            mid: m.id.clone(),
            time: m.time,
            expires: m.expires,
            topic: m.topic.clone(),
            message: m.message.clone(),
            title: m.title.clone(),
            priority: i64::from(m.priority),
            tags: m.tags.join(","),
            click: m.click.clone(),
            icon: m.icon.clone(),
            actions,
            attachment_name: attachment.name,
            attachment_type: attachment.content_type,
            attachment_size: attachment.size,
            attachment_expires: attachment.expires,
            attachment_url: attachment.url,
            sender: m.sender.map(|ip| ip.to_string()).unwrap_or_default(),
            user: m.user.clone(),
            content_type: m.content_type.clone(),
            encoding: m.encoding.clone(),
            published: m.time <= now,
        })
    }
}

/// Reads a message from a row selected with the shared column list.
pub(crate) fn read_message<'r, R>(row: &'r R) -> Result<Message>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    String: Decode<'r, R::Database> + Type<R::Database>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
{
    let tags: String = row.try_get("tags")?;
    let actions: String = row.try_get("actions")?;
    let sender: String = row.try_get("sender")?;
    let priority: i64 = row.try_get("priority")?;
    let attachment_name: String = row.try_get("attachment_name")?;
    let attachment_url: String = row.try_get("attachment_url")?;

    let actions: Vec<Action> = if actions.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&actions)?
    };
    let attachment = if !attachment_name.is_empty() && !attachment_url.is_empty() {
        Some(Attachment {
            name: attachment_name,
            content_type: row.try_get("attachment_type")?,
            size: row.try_get("attachment_size")?,
            expires: row.try_get("attachment_expires")?,
            url: attachment_url,
        })
    } else {
        None
    };

    Ok(Message {
        id: row.try_get("mid")?,
        time: row.try_get("time")?,
        expires: row.try_get("expires")?,
        event: Event::Message,
        topic: row.try_get("topic")?,
        message: row.try_get("message")?,
        title: row.try_get("title")?,
        priority: u8::try_from(priority).unwrap_or(0),
        tags: split_tags(&tags),
        click: row.try_get("click")?,
        icon: row.try_get("icon")?,
        actions,
        attachment,
        poll_id: String::new(),
        content_type: row.try_get("content_type")?,
        encoding: row.try_get("encoding")?,
        sender: sender.parse::<IpAddr>().ok(),
        user: row.try_get("user")?,
    })
}

/// Maps a failed insert of message `id`, turning a unique-key violation into
/// [`Error::DuplicateMessage`].
pub(crate) fn insert_error(e: sqlx::Error, id: &str) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::DuplicateMessage(id.to_string())
        }
        _ => Error::from(e),
    }
}

fn split_tags(tags: &str) -> Vec<String> {
    if tags.is_empty() {
        Vec::new()
    } else {
        tags.split(',').map(str::to_string).collect()
    }
}
