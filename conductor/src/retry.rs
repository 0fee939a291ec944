//! Bounded retry with exponential backoff for transient backend faults.
//!
//! Retry re-issues the same request after a delay. It sits underneath the
//! self-correction loop, which instead issues a new, error-informed request.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::core::backoff::backoff_delay;
use crate::io::backend::{BackendError, is_rate_limited};
use crate::io::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first call; 0 means a single call whose error propagates as is.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: cfg.base_delay(),
            max_delay: cfg.max_delay(),
        }
    }
}

/// Run `op`, retrying rate-limited failures per `policy`.
///
/// `op` receives the 0-based call index.
pub fn with_retry<T>(
    policy: RetryPolicy,
    cancel: Option<&CancelToken>,
    op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    with_retry_observed(policy, cancel, is_rate_limited, |_, _, _| {}, op)
}

/// [`with_retry`] with a custom classifier and a hook called before each backoff sleep.
///
/// `observe` receives the 1-based retry number, the delay about to be slept and
/// the error that triggered it.
pub fn with_retry_observed<T>(
    policy: RetryPolicy,
    cancel: Option<&CancelToken>,
    classify: impl Fn(&anyhow::Error) -> bool,
    mut observe: impl FnMut(u32, Duration, &anyhow::Error),
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut call = 0u32;
    loop {
        let err = match op(call) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if policy.max_attempts == 0 || !classify(&err) {
            return Err(err);
        }
        if call >= policy.max_attempts {
            warn!(retries = call, "retries exhausted");
            return Err(err);
        }

        let retry = call + 1;
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let delay = backoff_delay(policy.base_delay, retry, policy.max_delay, jitter);
        debug!(retry, delay_ms = delay.as_millis() as u64, err = %err, "transient failure; backing off");
        observe(retry, delay, &err);

        match cancel {
            Some(token) => {
                if !token.sleep(delay) {
                    return Err(BackendError::Cancelled.into());
                }
            }
            None => std::thread::sleep(delay),
        }
        call = retry;
    }
}
