use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub log: LogSettings,
    pub cache: CacheSettings,
    pub broker: BrokerSettings,
    pub visitor: VisitorSettings,
    pub attachment: AttachmentSettings,
}

/// Logging output.
#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

/// Message cache backend and write batching.
///
/// An empty `database_url` and `file` select the in-memory store. A zero duration
/// disables caching altogether.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    pub file: String,
    pub database_url: String,
    pub startup_queries: String,
    pub duration_secs: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_connections: u32,
}

/// Topic registry and background loops.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub manager_interval_secs: u64,
    pub delayed_sender_interval_secs: u64,
    pub keepalive_interval_secs: u64,
    pub total_topic_limit: usize,
    pub topic_expunge_after_secs: u64,
    pub disallowed_topics: Vec<String>,
}

/// Per-visitor quotas.
///
/// A zero `message_daily_limit` derives the daily cap from the request replenish
/// interval. A zero `attachment_bandwidth_limit` leaves downloads unmetered.
#[derive(Debug, Deserialize, Clone)]
pub struct VisitorSettings {
    pub subscription_limit: i64,
    pub request_limit_burst: u32,
    pub request_limit_replenish_ms: u64,
    pub message_daily_limit: i64,
    pub attachment_total_size_limit: i64,
    pub attachment_bandwidth_limit: i64,
    pub expunge_after_secs: u64,
}

/// Attachment storage. An empty `cache_dir` disables attachments.
#[derive(Debug, Deserialize, Clone)]
pub struct AttachmentSettings {
    pub cache_dir: String,
    pub total_size_limit: i64,
    pub file_size_limit: i64,
    pub expiry_duration_secs: u64,
}

impl CacheSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

impl BrokerSettings {
    pub fn manager_interval(&self) -> Duration {
        Duration::from_secs(self.manager_interval_secs)
    }

    pub fn delayed_sender_interval(&self) -> Duration {
        Duration::from_secs(self.delayed_sender_interval_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn topic_expunge_after(&self) -> Duration {
        Duration::from_secs(self.topic_expunge_after_secs)
    }
}

impl AttachmentSettings {
    pub fn expiry_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_duration_secs)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Every value is optional. Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub log: Option<PartialLogSettings>,
    pub cache: Option<PartialCacheSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub visitor: Option<PartialVisitorSettings>,
    pub attachment: Option<PartialAttachmentSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialCacheSettings {
    pub file: Option<String>,
    pub database_url: Option<String>,
    pub startup_queries: Option<String>,
    pub duration_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub manager_interval_secs: Option<u64>,
    pub delayed_sender_interval_secs: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub total_topic_limit: Option<usize>,
    pub topic_expunge_after_secs: Option<u64>,
    pub disallowed_topics: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialVisitorSettings {
    pub subscription_limit: Option<i64>,
    pub request_limit_burst: Option<u32>,
    pub request_limit_replenish_ms: Option<u64>,
    pub message_daily_limit: Option<i64>,
    pub attachment_total_size_limit: Option<i64>,
    pub attachment_bandwidth_limit: Option<i64>,
    pub expunge_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialAttachmentSettings {
    pub cache_dir: Option<String>,
    pub total_size_limit: Option<i64>,
    pub file_size_limit: Option<i64>,
    pub expiry_duration_secs: Option<u64>,
}

impl PartialSettings {
    /// Fills every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let log = self.log.unwrap_or_default();
        let cache = self.cache.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let visitor = self.visitor.unwrap_or_default();
        let attachment = self.attachment.unwrap_or_default();
        Settings {
            log: LogSettings {
                level: log.level.unwrap_or(defaults.log.level),
                json: log.json.unwrap_or(defaults.log.json),
            },
            cache: CacheSettings {
                file: cache.file.unwrap_or(defaults.cache.file),
                database_url: cache.database_url.unwrap_or(defaults.cache.database_url),
                startup_queries: cache
                    .startup_queries
                    .unwrap_or(defaults.cache.startup_queries),
                duration_secs: cache.duration_secs.unwrap_or(defaults.cache.duration_secs),
                batch_size: cache.batch_size.unwrap_or(defaults.cache.batch_size),
                batch_timeout_ms: cache
                    .batch_timeout_ms
                    .unwrap_or(defaults.cache.batch_timeout_ms),
                max_connections: cache
                    .max_connections
                    .unwrap_or(defaults.cache.max_connections),
            },
            broker: BrokerSettings {
                manager_interval_secs: broker
                    .manager_interval_secs
                    .unwrap_or(defaults.broker.manager_interval_secs),
                delayed_sender_interval_secs: broker
                    .delayed_sender_interval_secs
                    .unwrap_or(defaults.broker.delayed_sender_interval_secs),
                keepalive_interval_secs: broker
                    .keepalive_interval_secs
                    .unwrap_or(defaults.broker.keepalive_interval_secs),
                total_topic_limit: broker
                    .total_topic_limit
                    .unwrap_or(defaults.broker.total_topic_limit),
                topic_expunge_after_secs: broker
                    .topic_expunge_after_secs
                    .unwrap_or(defaults.broker.topic_expunge_after_secs),
                disallowed_topics: broker
                    .disallowed_topics
                    .unwrap_or(defaults.broker.disallowed_topics),
            },
            visitor: VisitorSettings {
                subscription_limit: visitor
                    .subscription_limit
                    .unwrap_or(defaults.visitor.subscription_limit),
                request_limit_burst: visitor
                    .request_limit_burst
                    .unwrap_or(defaults.visitor.request_limit_burst),
                request_limit_replenish_ms: visitor
                    .request_limit_replenish_ms
                    .unwrap_or(defaults.visitor.request_limit_replenish_ms),
                message_daily_limit: visitor
                    .message_daily_limit
                    .unwrap_or(defaults.visitor.message_daily_limit),
                attachment_total_size_limit: visitor
                    .attachment_total_size_limit
                    .unwrap_or(defaults.visitor.attachment_total_size_limit),
                attachment_bandwidth_limit: visitor
                    .attachment_bandwidth_limit
                    .unwrap_or(defaults.visitor.attachment_bandwidth_limit),
                expunge_after_secs: visitor
                    .expunge_after_secs
                    .unwrap_or(defaults.visitor.expunge_after_secs),
            },
            attachment: AttachmentSettings {
                cache_dir: attachment.cache_dir.unwrap_or(defaults.attachment.cache_dir),
                total_size_limit: attachment
                    .total_size_limit
                    .unwrap_or(defaults.attachment.total_size_limit),
                file_size_limit: attachment
                    .file_size_limit
                    .unwrap_or(defaults.attachment.file_size_limit),
                expiry_duration_secs: attachment
                    .expiry_duration_secs
                    .unwrap_or(defaults.attachment.expiry_duration_secs),
            },
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            file: String::new(),
            database_url: String::new(),
            startup_queries: String::new(),
            duration_secs: 12 * 3600,
            batch_size: 0,
            batch_timeout_ms: 0,
            max_connections: 10,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            manager_interval_secs: 60,
            delayed_sender_interval_secs: 10,
            keepalive_interval_secs: 45,
            total_topic_limit: 15_000,
            topic_expunge_after_secs: 16 * 3600,
            disallowed_topics: [
                "docs", "static", "file", "app", "metrics", "account", "settings", "signup",
                "login", "v1",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
        }
    }
}

impl Default for VisitorSettings {
    fn default() -> Self {
        Self {
            subscription_limit: 30,
            request_limit_burst: 60,
            request_limit_replenish_ms: 5_000,
            message_daily_limit: 0,
            attachment_total_size_limit: 100 * 1024 * 1024,
            attachment_bandwidth_limit: 500 * 1024 * 1024,
            expunge_after_secs: 24 * 3600,
        }
    }
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            total_size_limit: 5 * 1024 * 1024 * 1024,
            file_size_limit: 15 * 1024 * 1024,
            expiry_duration_secs: 3 * 3600,
        }
    }
}
