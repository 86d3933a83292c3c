//! Resource and rate limiters.
//!
//! - [`FixedLimiter`] is a counting limiter with a hard ceiling. It caps concurrent
//!   resources such as active subscriptions or attachment bytes.
//! - [`RateLimiter`] is a token bucket: `burst` tokens up front, one token added back
//!   every `replenish` interval. Tokens can be taken one at a time (requests) or in
//!   bulk (bytes).
//!
//! Both are cheap to share behind an `Arc` and hold their lock only long enough to
//! read and update a counter.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::utils::error::{Error, Result};

/// Counting limiter that refuses to go over a fixed ceiling.
#[derive(Debug)]
pub struct FixedLimiter {
    value: Mutex<i64>,
    limit: i64,
}

impl FixedLimiter {
    pub fn new(limit: i64) -> Self {
        Self::with_value(limit, 0)
    }

    /// Creates a limiter that already accounts for `value` units.
    pub fn with_value(limit: i64, value: i64) -> Self {
        Self {
            value: Mutex::new(value.max(0)),
            limit,
        }
    }

    /// Adds `n` units, failing with [`Error::LimitReached`] if the new total would exceed
    /// the ceiling. Nothing is committed on failure.
    pub fn add(&self, n: i64) -> Result<()> {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if *value + n > self.limit {
            return Err(Error::LimitReached);
        }
        *value += n;
        Ok(())
    }

    /// Releases `n` units. The counter never drops below zero.
    pub fn sub(&self, n: i64) {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *value = (*value - n).max(0);
    }

    pub fn value(&self) -> i64 {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn remaining(&self) -> i64 {
        (self.limit - self.value()).max(0)
    }

    pub fn reset(&self) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token-bucket limiter.
///
/// A zero `replenish` interval disables limiting entirely.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    burst: u64,
    replenish: Duration,
}

impl RateLimiter {
    pub fn new(burst: u64, replenish: Duration) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                refilled_at: Instant::now(),
            }),
            burst,
            replenish,
        }
    }

    /// Allows `limit` tokens per `period`, all of them available up front. Used for byte
    /// budgets such as a daily download allowance. A zero limit is unlimited.
    pub fn per_period(limit: u64, period: Duration) -> Self {
        let replenish = if limit == 0 {
            Duration::ZERO
        } else {
            period.div_f64(limit as f64)
        };
        Self::new(limit, replenish)
    }

    /// Consumes one token if available.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Consumes `n` tokens if all of them are available. Nothing is taken otherwise.
    pub fn allow_n(&self, n: u64) -> bool {
        if self.replenish.is_zero() {
            return true;
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let refill = now.duration_since(bucket.refilled_at).as_secs_f64() / self.replenish.as_secs_f64();
        bucket.tokens = (bucket.tokens + refill).min(self.burst as f64);
        bucket.refilled_at = now;
        let wanted = n as f64;
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available, without consuming any.
    pub fn tokens(&self) -> u64 {
        if self.replenish.is_zero() {
            return self.burst;
        }
        let bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let refill = bucket.refilled_at.elapsed().as_secs_f64() / self.replenish.as_secs_f64();
        (bucket.tokens + refill).min(self.burst as f64).floor() as u64
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    pub fn replenish(&self) -> Duration {
        self.replenish
    }
}
