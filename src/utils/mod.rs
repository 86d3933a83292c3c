//! The `utils` module provides the building blocks shared across `notifycast`:
//! the error type, resource and rate limiters, the batching queue, logging setup
//! and random identifiers.

pub mod batching_queue;
pub mod error;
pub mod limiter;
pub mod logging;

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Returns a random string of ASCII letters and digits.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests;
