//! # notifycast
//!
//! `notifycast` is the messaging core of a topic-based publish/subscribe notification
//! server. Clients publish short messages to named topics; subscribers hold long-lived
//! connections (or poll) and can replay history by time or by message ID.
//!
//! ## Core Modules
//!
//! - `broker`: topics and their live subscriptions, visitors and their quotas, the
//!   server that ties them together, and the periodic manager loop.
//! - `persistence`: the message cache contract and its memory, SQLite and PostgreSQL
//!   backends, write batching, and attachment file storage.
//! - `config`: loading and merging server configuration.
//! - `utils`: errors, limiters, the batching queue and logging setup.
//!
//! Delivery to live subscribers is at-least-once: a client replaying history and then
//! switching to live delivery may see one message twice, but never misses one.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod utils;
