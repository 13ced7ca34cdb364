//! Rate-limited executor adapter
//!
//! Retries throttled role invocations with exponential backoff, preferring
//! a reset time supplied by the executor when one is available. Only
//! [`ExecutorError::Retryable`] is retried; everything else surfaces on
//! first occurrence. Every wait and every in-flight attempt is abandoned as
//! soon as the run-level [`CancellationToken`] fires.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecutorError, RateLimitError};
use crate::executor::{RoleExecutor, RoleOutput, RoleRequest};

/// Hint keys consulted in order
pub const RESET_HINT_KEYS: [&str; 3] = [
    "x-ratelimit-reset-requests",
    "x-ratelimit-reset-tokens",
    "retry-after",
];

// Literal patterns; compiling them cannot fail.
static GO_DURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\d+(?:\.\d+)?(?:ms|h|m|s))+$").expect("duration pattern"));
static GO_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").expect("duration segment pattern"));

/// Backoff parameters; total attempts are `max_retries + 1`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    pub exponential_base: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter, as a fraction of the delay
    pub jitter: f64,
    pub honor_reset_hint: bool,
    #[serde(rename = "max_reset_wait_ms", with = "duration_ms")]
    pub max_reset_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            initial_delay: Duration::from_secs(1),
            exponential_base: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            honor_reset_hint: true,
            max_reset_wait: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// No waiting at all; handy for dry runs
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            honor_reset_hint: false,
            ..Self::default()
        }
    }

    /// `min(initial_delay * base^attempt, max_delay)`, without jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Wait after failed attempt `attempt` (0-based)
    #[must_use]
    pub fn wait_for(&self, attempt: u32, error: &ExecutorError, now: DateTime<Utc>) -> Duration {
        if self.honor_reset_hint {
            if let Some(hint) = error.hints().and_then(|h| reset_hint(h, now)) {
                if !hint.is_zero() {
                    return hint.min(self.max_reset_wait);
                }
            }
        }
        let delay = self.backoff(attempt);
        if self.jitter > 0.0 && !delay.is_zero() {
            let spread = delay.as_secs_f64() * self.jitter;
            delay + Duration::from_secs_f64(rand::rng().random_range(0.0..=spread))
        } else {
            delay
        }
    }
}

/// First parseable reset hint among [`RESET_HINT_KEYS`] (keys matched case-insensitively)
#[must_use]
pub fn reset_hint(hints: &BTreeMap<String, String>, now: DateTime<Utc>) -> Option<Duration> {
    RESET_HINT_KEYS.iter().find_map(|key| {
        hints
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| parse_reset_hint(v, now))
    })
}

/// Parse plain seconds, a Go-style duration (`1h2m3s`, `250ms`) or an HTTP date
#[must_use]
pub fn parse_reset_hint(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| saturating_secs(secs));
    }
    let lowered = value.to_ascii_lowercase();
    if GO_DURATION.is_match(&lowered) {
        let mut total = 0.0;
        for cap in GO_SEGMENT.captures_iter(&lowered) {
            let amount: f64 = cap[1].parse().ok()?;
            total += match &cap[2] {
                "h" => amount * 3600.0,
                "m" => amount * 60.0,
                "ms" => amount / 1000.0,
                _ => amount,
            };
        }
        return Some(saturating_secs(total));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}

/// Out-of-range hints saturate; [`RetryPolicy::wait_for`] caps them anyway
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Run `call` until it succeeds, fails non-retryably or exhausts `policy`
///
/// `call` receives the 0-based attempt number.
///
/// # Errors
/// [`RateLimitError::Exhausted`] carrying the last error,
/// [`RateLimitError::Fatal`] for non-retryable errors, or
/// [`RateLimitError::Cancelled`]
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, RateLimitError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ExecutorError>>,
{
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            result = call(attempt) => result,
            () = cancel.cancelled() => return Err(RateLimitError::Cancelled),
        };
        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(RateLimitError::Fatal(e)),
            Err(e) => e,
        };
        if attempt >= policy.max_retries {
            warn!(attempts = attempt + 1, error = %error, "rate limit retries exhausted");
            return Err(RateLimitError::Exhausted {
                attempts: attempt + 1,
                last: error,
            });
        }
        let wait = policy.wait_for(attempt, &error, Utc::now());
        debug!(attempt, wait = ?wait, error = %error, "throttled; backing off");
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = cancel.cancelled() => return Err(RateLimitError::Cancelled),
        }
        attempt += 1;
    }
}

/// Invoke a role executor under `policy`
///
/// # Errors
/// See [`retry_with_policy`]
pub async fn invoke_with_retry(
    executor: &dyn RoleExecutor,
    request: &RoleRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<RoleOutput, RateLimitError> {
    retry_with_policy(policy, cancel, |_| executor.invoke(request)).await
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
