//! Retry budget and backoff policy
//!
//! The store applies these decisions inside the same transaction that records
//! the failure, so the policy itself stays free of I/O and easy to test.

use crate::state::FailureKind;
use std::time::Duration;

/// Exponential backoff with a cap
///
/// `delay(0)` is zero so first attempts and proactive refreshes are claimable
/// at once; `delay(n) = min(base * factor^(n-1), cap)` for `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: u32, cap: Duration) -> Self {
        Self { base, factor, cap }
    }

    /// Delay before a resource with the given recrawl count may be claimed again
    pub fn delay(&self, recrawl_count: u32) -> Duration {
        if recrawl_count == 0 {
            return Duration::ZERO;
        }

        let exponent = recrawl_count - 1;
        let multiplier = self.factor.max(1).checked_pow(exponent);

        match multiplier.and_then(|m| self.base.checked_mul(m)) {
            Some(delay) => delay.min(self.cap),
            None => self.cap,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            factor: 2,
            cap: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// How a recorded failure is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Back to `Discovered` with the new recrawl count, claimable after `delay`
    Retry { recrawl_count: u32, delay: Duration },

    /// Retry budget exhausted
    Abandon,

    /// Keep in `Error` for the operator; budget untouched
    Park,
}

/// Retry budget shared by every resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which a resource is abandoned
    pub max_retries: u32,

    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Decides what happens to a resource after a failed attempt
    ///
    /// # Arguments
    ///
    /// * `kind` - Classification of the failure just observed
    /// * `recrawl_count` - Retries already admitted for this resource
    /// * `previous` - Kind of the failure recorded before this one, if any
    pub fn resolve(
        &self,
        kind: FailureKind,
        recrawl_count: u32,
        previous: Option<FailureKind>,
    ) -> Resolution {
        if !kind.consumes_retry_budget() {
            return Resolution::Park;
        }

        // A permanent failure gets exactly one more try.
        if kind == FailureKind::Permanent && previous == Some(FailureKind::Permanent) {
            return Resolution::Abandon;
        }

        let next = recrawl_count.saturating_add(1);
        if next < self.max_retries {
            Resolution::Retry {
                recrawl_count: next,
                delay: self.backoff.delay(next),
            }
        } else {
            Resolution::Abandon
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}
