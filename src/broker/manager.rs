//! Manager loop
//!
//! A periodic sweep over the server's state. Every step stands alone: an error is
//! logged and the remaining steps still run.
//!
//! Steps, in order:
//! - evict stale visitors
//! - remove deleted accounts through the [`UserManager`], if one is configured
//! - delete expired attachments (files first, then the cache flag)
//! - delete expired messages
//! - count cached messages per topic and drop topics that are stale and message-less
//! - log aggregate stats and persist the published-messages counter
//!
//! A separate daily task resets per-visitor message counters at midnight UTC.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use tracing::{debug, info, warn};

use crate::broker::engine::Server;
use crate::utils::error::Result;

/// Account management collaborator.
#[async_trait]
pub trait UserManager: Send + Sync {
    /// Removes accounts whose deletion grace period has passed.
    async fn remove_deleted_users(&self) -> Result<()>;

    /// Resets per-account daily counters.
    async fn reset_stats(&self) -> Result<()> {
        Ok(())
    }
}

/// Aggregate counters reported after each sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub messages_published: i64,
    pub messages_cached: i64,
    pub topics_active: usize,
    pub subscribers: usize,
    pub visitors: usize,
}

impl Server {
    /// Runs one maintenance sweep.
    pub async fn exec_manager(&self) -> ManagerStats {
        debug!("Starting manager");
        self.prune_visitors();
        self.prune_users().await;
        self.prune_attachments().await;
        self.prune_messages().await;

        let counts = match self.message_cache.message_counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "Cannot get message counts");
                None
            }
        };
        if let Some(counts) = &counts {
            self.prune_topics(counts);
        }

        let topics = self.snapshot_topics();
        let stats = ManagerStats {
            messages_published: self.messages.load(Ordering::Relaxed),
            messages_cached: counts.map(|c| c.values().sum()).unwrap_or(0),
            topics_active: topics.len(),
            subscribers: topics.iter().map(|t| t.subscribers_count()).sum(),
            visitors: self.visitors_count(),
        };
        info!(
            messages_published = stats.messages_published,
            messages_cached = stats.messages_cached,
            topics_active = stats.topics_active,
            subscribers = stats.subscribers,
            visitors = stats.visitors,
            "Server stats"
        );
        if let Err(e) = self
            .message_cache
            .update_stats(stats.messages_published)
            .await
        {
            warn!(error = %e, "Cannot write messages stats");
        }
        stats
    }

    /// Runs [`Server::exec_manager`] every `interval` until the task is dropped.
    pub async fn run_manager(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.exec_manager().await;
        }
    }

    /// Resets the daily message counters of every visitor and account.
    pub async fn reset_stats(&self) {
        info!("Resetting all visitor stats (daily task)");
        let visitors: Vec<_> = self.lock_visitors().values().cloned().collect();
        for visitor in &visitors {
            visitor.reset_stats();
        }
        if let Some(user_manager) = &self.user_manager {
            if let Err(e) = user_manager.reset_stats().await {
                warn!(error = %e, "Error resetting user stats");
            }
        }
    }

    /// Runs [`Server::reset_stats`] every day at midnight UTC until the task is dropped.
    pub async fn run_stats_resetter(self: Arc<Self>) {
        loop {
            tokio::time::sleep(until_next_day(Utc::now())).await;
            self.reset_stats().await;
        }
    }

    fn prune_visitors(&self) {
        let mut visitors = self.lock_visitors();
        let before = visitors.len();
        visitors.retain(|_, v| v.subscriptions() > 0 || !v.stale());
        let removed = before - visitors.len();
        if removed > 0 {
            debug!(removed, "Removed stale visitors");
        }
    }

    async fn prune_users(&self) {
        let Some(user_manager) = &self.user_manager else {
            return;
        };
        if let Err(e) = user_manager.remove_deleted_users().await {
            warn!(error = %e, "Error removing deleted users");
        }
    }

    async fn prune_attachments(&self) {
        let Some(file_cache) = &self.file_cache else {
            return;
        };
        let ids = match self.message_cache.attachments_expired().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Error retrieving expired attachments");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        debug!(count = ids.len(), "Deleting expired attachments");
        if let Err(e) = file_cache.remove(&ids).await {
            warn!(error = %e, "Error deleting attachments");
            return;
        }
        if let Err(e) = self.message_cache.mark_attachments_deleted(&ids).await {
            warn!(error = %e, "Error marking attachments deleted");
        }
    }

    async fn prune_messages(&self) {
        let ids = match self.message_cache.messages_expired().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Error retrieving expired messages");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        debug!(count = ids.len(), "Deleting expired messages");
        if let Some(file_cache) = &self.file_cache {
            if let Err(e) = file_cache.remove(&ids).await {
                warn!(error = %e, "Error deleting attachments of expired messages");
            }
        }
        if let Err(e) = self.message_cache.delete_messages(&ids).await {
            warn!(error = %e, "Error deleting expired messages");
        }
    }

    fn prune_topics(&self, counts: &HashMap<String, i64>) {
        let mut topics = self.lock_topics();
        topics.retain(|name, topic| {
            let keep = !topic.stale() || counts.get(name).copied().unwrap_or(0) > 0;
            if !keep {
                debug!(topic = %name, "Removing stale topic");
            }
            keep
        });
    }
}

/// Time left until the next midnight UTC.
pub(crate) fn until_next_day(now: DateTime<Utc>) -> Duration {
    let midnight = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .map(|day| day.and_time(NaiveTime::MIN).and_utc());
    midnight
        .and_then(|at| (at - now).to_std().ok())
        .unwrap_or(Duration::from_secs(24 * 3600))
}
