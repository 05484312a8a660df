use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode};

use crate::options::Options;
use crate::util::parse_retry_after;

const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// A completed attempt as seen by the retry policy: either a response with a
/// status, or a transport-level failure.
#[derive(Clone, Copy, Debug)]
pub(crate) enum AttemptOutcome<'a> {
    Response {
        status: StatusCode,
        headers: &'a HeaderMap,
    },
    TransportError,
}

/// Stateless retry decision derived from the client options. Retries are
/// restricted to idempotent methods; the backoff for the attempt that just
/// completed is `retry_delay * 2^(attempt - 1)`.
#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    attempts: usize,
    delay: Duration,
    status_codes: BTreeSet<u16>,
}

impl RetryPolicy {
    pub(crate) fn from_options(options: &Options) -> Self {
        Self {
            attempts: options.retry_attempts(),
            delay: options.retry_delay(),
            status_codes: options.retry_status_codes().clone(),
        }
    }

    /// Returns the delay to wait before re-admitting the request, or `None`
    /// when the outcome should be delivered as-is.
    pub(crate) fn assess(
        &self,
        attempt: usize,
        method: &Method,
        outcome: &AttemptOutcome<'_>,
    ) -> Option<Duration> {
        if !is_method_idempotent(method) {
            return None;
        }
        if attempt > self.attempts {
            return None;
        }

        let retryable = match outcome {
            AttemptOutcome::TransportError => true,
            AttemptOutcome::Response { status, .. } => {
                self.status_codes.contains(&status.as_u16())
            }
        };
        if !retryable {
            return None;
        }

        let backoff = self.backoff_for_attempt(attempt);
        // A Retry-After hint may stretch the delay but never undercuts the
        // exponential floor.
        let delay = match outcome {
            AttemptOutcome::Response { headers, .. } => {
                match parse_retry_after(headers, SystemTime::now()) {
                    Some(hinted) => backoff.max(hinted.min(MAX_RETRY_AFTER)),
                    None => backoff,
                }
            }
            AttemptOutcome::TransportError => backoff,
        };
        Some(delay)
    }

    pub(crate) fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let capped_exponent = attempt.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.delay.as_millis().max(1);
        let delay_ms = base_ms.saturating_mul(multiplier).min(u64::MAX as u128) as u64;
        Duration::from_millis(delay_ms)
    }
}

/// The methods the retry scheduler may ever re-issue. POST, PATCH, TRACE and
/// CONNECT are never retried, whatever the outcome.
pub(crate) fn is_method_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}
