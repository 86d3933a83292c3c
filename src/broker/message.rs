use std::collections::HashMap;
use std::net::IpAddr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Error, Result};
use crate::utils::random_string;

/// Length of a message ID.
pub const MESSAGE_ID_LENGTH: usize = 12;

/// Returns true if `id` has the shape of a message ID.
pub fn valid_message_id(id: &str) -> bool {
    id.len() == MESSAGE_ID_LENGTH && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Kind of event carried by a [`Message`].
///
/// Only [`Event::Message`] is ever persisted. `open` and `keepalive` are transient
/// connection events and `poll_request` asks a client to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Open,
    Keepalive,
    Message,
    PollRequest,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Open => "open",
            Event::Keepalive => "keepalive",
            Event::Message => "message",
            Event::PollRequest => "poll_request",
        }
    }
}

/// File attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires: i64,
    pub url: String,
}

/// User-facing action button attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub action: String,
    pub label: String,
    #[serde(default)]
    pub clear: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub intent: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, String>,
}

/// A message published to a topic.
///
/// `time` and `expires` are Unix timestamps in seconds. A `time` in the future marks
/// a scheduled message: it is stored unpublished and only fanned out once due.
/// `sender` and `user` identify the publisher and are never serialized to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub time: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires: i64,
    pub event: Event,
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub click: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub poll_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encoding: String,
    #[serde(skip)]
    pub sender: Option<IpAddr>,
    #[serde(skip)]
    pub user: String,
}

impl Message {
    /// Creates an event with a fresh ID and the current time.
    pub fn new(event: Event, topic: &str) -> Self {
        Self {
            id: random_string(MESSAGE_ID_LENGTH),
            time: Utc::now().timestamp(),
            expires: 0,
            event,
            topic: topic.to_string(),
            message: String::new(),
            title: String::new(),
            priority: 0,
            tags: Vec::new(),
            click: String::new(),
            icon: String::new(),
            actions: Vec::new(),
            attachment: None,
            poll_id: String::new(),
            content_type: String::new(),
            encoding: String::new(),
            sender: None,
            user: String::new(),
        }
    }

    /// Creates a `message` event with the given body.
    pub fn new_default(topic: &str, body: &str) -> Self {
        let mut m = Self::new(Event::Message, topic);
        m.message = body.to_string();
        m
    }

    pub fn open(topic: &str) -> Self {
        Self::new(Event::Open, topic)
    }

    pub fn keepalive(topic: &str) -> Self {
        Self::new(Event::Keepalive, topic)
    }

    pub fn poll_request(topic: &str, poll_id: &str) -> Self {
        let mut m = Self::new(Event::PollRequest, topic);
        m.poll_id = poll_id.to_string();
        m
    }

    /// True if the message is scheduled for a time after `now`.
    pub fn is_scheduled(&self, now: i64) -> bool {
        self.time > now
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u8(v: &u8) -> bool {
    *v == 0
}

/// Replay cursor used when reading history from the message cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinceMarker {
    /// Everything still cached.
    All,
    /// No history at all.
    Nothing,
    /// Messages with `time >= t`.
    Time(i64),
    /// Messages stored after the message with this ID.
    Id(String),
}

impl SinceMarker {
    /// Parses a client-supplied marker.
    ///
    /// Accepts `""`/`none`, `all`, a message ID, a Unix timestamp or a duration
    /// relative to now (`30s`, `10m`, `2h`, `1d`).
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        match value {
            "" | "none" => return Ok(SinceMarker::Nothing),
            "all" => return Ok(SinceMarker::All),
            _ => {}
        }
        if valid_message_id(value) {
            return Ok(SinceMarker::Id(value.to_string()));
        }
        if let Ok(ts) = value.parse::<i64>() {
            return Ok(SinceMarker::Time(ts));
        }
        if let Some(secs) = parse_duration_secs(value) {
            return Ok(SinceMarker::Time(Utc::now().timestamp() - secs));
        }
        Err(Error::InvalidSince(value.to_string()))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, SinceMarker::All | SinceMarker::Time(0))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, SinceMarker::Nothing)
    }

    pub fn is_id(&self) -> bool {
        matches!(self, SinceMarker::Id(_))
    }

    /// Lower time bound of the marker. ID markers resolve elsewhere and report 0.
    pub fn time(&self) -> i64 {
        match self {
            SinceMarker::Time(t) => *t,
            _ => 0,
        }
    }
}

fn parse_duration_secs(value: &str) -> Option<i64> {
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = value.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    let factor = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    amount.checked_mul(factor)
}
