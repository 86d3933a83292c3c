use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::VisitorSettings;
use crate::persistence::MessageCache;
use crate::utils::error::{Error, Result};
use crate::utils::limiter::{FixedLimiter, RateLimiter};

const ONE_DAY: Duration = Duration::from_secs(24 * 3600);

/// Quotas applied to every visitor.
#[derive(Debug, Clone)]
pub struct VisitorLimits {
    pub request_limit_burst: u32,
    pub request_limit_replenish: Duration,
    pub subscription_limit: i64,
    /// Messages per day, reset by [`Visitor::reset_stats`].
    pub message_limit: i64,
    pub attachment_total_size_limit: i64,
    /// Attachment bytes a visitor may download per day. Zero is unmetered.
    pub attachment_bandwidth_limit: i64,
    pub expunge_after: Duration,
}

impl From<&VisitorSettings> for VisitorLimits {
    fn from(settings: &VisitorSettings) -> Self {
        let request_limit_replenish = Duration::from_millis(settings.request_limit_replenish_ms);
        let message_limit = if settings.message_daily_limit > 0 {
            settings.message_daily_limit
        } else {
            daily_limit(request_limit_replenish)
        };
        Self {
            request_limit_burst: settings.request_limit_burst,
            request_limit_replenish,
            subscription_limit: settings.subscription_limit,
            message_limit,
            attachment_total_size_limit: settings.attachment_total_size_limit,
            attachment_bandwidth_limit: settings.attachment_bandwidth_limit,
            expunge_after: Duration::from_secs(settings.expunge_after_secs),
        }
    }
}

/// Requests a fully drained bucket can still make in a day.
fn daily_limit(replenish: Duration) -> i64 {
    if replenish.is_zero() {
        return i64::MAX;
    }
    i64::try_from(ONE_DAY.as_millis() / replenish.as_millis().max(1)).unwrap_or(i64::MAX)
}

impl Default for VisitorLimits {
    fn default() -> Self {
        Self::from(&VisitorSettings::default())
    }
}

/// Message and attachment usage of a visitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorInfo {
    pub messages: i64,
    pub messages_remaining: i64,
    pub messages_limit: i64,
    pub attachment_total_size: i64,
    pub attachment_total_size_remaining: i64,
    pub attachment_total_size_limit: i64,
}

/// Rate and quota state of one client, identified by account or network address.
#[derive(Debug)]
pub struct Visitor {
    ip: IpAddr,
    user_id: Option<String>,
    limits: VisitorLimits,
    request_limiter: RateLimiter,
    subscription_limiter: FixedLimiter,
    messages_limiter: FixedLimiter,
    bandwidth_limiter: RateLimiter,
    seen: Mutex<Instant>,
}

impl Visitor {
    pub fn new(limits: &VisitorLimits, ip: IpAddr, user_id: Option<&str>) -> Self {
        Self {
            ip,
            user_id: user_id.map(str::to_string),
            limits: limits.clone(),
            request_limiter: RateLimiter::new(
                u64::from(limits.request_limit_burst),
                limits.request_limit_replenish,
            ),
            subscription_limiter: FixedLimiter::new(limits.subscription_limit),
            messages_limiter: FixedLimiter::new(limits.message_limit),
            bandwidth_limiter: RateLimiter::per_period(
                u64::try_from(limits.attachment_bandwidth_limit).unwrap_or(0),
                ONE_DAY,
            ),
            seen: Mutex::new(Instant::now()),
        }
    }

    /// Registry key of a visitor: `user:<id>` for accounts, `ip:<addr>` otherwise.
    pub fn key(ip: IpAddr, user_id: Option<&str>) -> String {
        match user_id {
            Some(user) => format!("user:{user}"),
            None => format!("ip:{ip}"),
        }
    }

    pub fn id(&self) -> String {
        Self::key(self.ip, self.user_id.as_deref())
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Consumes one request token.
    pub fn request_allowed(&self) -> Result<()> {
        if self.request_limiter.allow() {
            Ok(())
        } else {
            Err(Error::TooManyRequests)
        }
    }

    /// Counts one published message against the daily limit.
    pub fn message_allowed(&self) -> Result<()> {
        self.messages_limiter
            .add(1)
            .map_err(|_| Error::TooManyRequests)
    }

    /// Charges `bytes` of attachment download against the daily bandwidth budget.
    pub fn bandwidth_allowed(&self, bytes: i64) -> Result<()> {
        if self
            .bandwidth_limiter
            .allow_n(u64::try_from(bytes).unwrap_or(0))
        {
            Ok(())
        } else {
            Err(Error::TooManyRequests)
        }
    }

    pub fn messages(&self) -> i64 {
        self.messages_limiter.value()
    }

    /// Starts a new day for the message counter.
    pub fn reset_stats(&self) {
        self.messages_limiter.reset();
    }

    pub fn add_subscription(&self) -> Result<()> {
        self.subscription_limiter
            .add(1)
            .map_err(|_| Error::TooManyRequests)
    }

    pub fn remove_subscription(&self) {
        self.subscription_limiter.sub(1);
    }

    pub fn subscriptions(&self) -> i64 {
        self.subscription_limiter.value()
    }

    pub fn keepalive(&self) {
        *self.seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn stale(&self) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
            >= self.limits.expunge_after
    }

    /// Messages sent today and attachment bytes charged to this visitor. Attachments
    /// are counted by account when authenticated, by address otherwise.
    pub async fn info(&self, cache: &dyn MessageCache) -> Result<VisitorInfo> {
        let used = match &self.user_id {
            Some(user) => cache.attachment_bytes_used_by_user(user).await?,
            None => {
                cache
                    .attachment_bytes_used_by_sender(&self.ip.to_string())
                    .await?
            }
        };
        let limit = self.limits.attachment_total_size_limit;
        Ok(VisitorInfo {
            messages: self.messages_limiter.value(),
            messages_remaining: self.messages_limiter.remaining(),
            messages_limit: self.messages_limiter.limit(),
            attachment_total_size: used,
            attachment_total_size_remaining: (limit - used).max(0),
            attachment_total_size_limit: limit,
        })
    }

    /// Limiter pre-charged with the bytes this visitor already stores.
    pub async fn attachment_limiter(&self, cache: &dyn MessageCache) -> Result<FixedLimiter> {
        let info = self.info(cache).await?;
        Ok(FixedLimiter::with_value(
            info.attachment_total_size_limit,
            info.attachment_total_size,
        ))
    }
}
