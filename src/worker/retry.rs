//! Bounded retries with exponential backoff around [`Invoke::execute`].
//!
//! Every failure is retried the same way, rate-limited or not, except an
//! empty output: that is a deterministic answer and comes back at once.

use opentelemetry::KeyValue;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Invoke, ProcessResult};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each one after.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Wait before the retry that follows attempt number `attempt` (0-based):
    /// `retry_delay * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

/// Run `input` through `invoker` until it succeeds, returns empty output,
/// or the retry budget is spent. The last result is returned unmodified.
pub async fn execute_with_retry<I>(
    invoker: &I,
    input: &str,
    work_dir: &Path,
    timeout: Duration,
    policy: RetryPolicy,
) -> ProcessResult
where
    I: Invoke + ?Sized,
{
    let mut attempt: u32 = 0;
    loop {
        let result = invoker.execute(input, work_dir, timeout).await;

        if result.success {
            if attempt > 0 {
                info!(attempts = attempt + 1, "invocation succeeded after retry");
            }
            return result;
        }

        if result.is_empty_output() {
            debug!(attempts = attempt + 1, "empty output, not retrying");
            return result;
        }

        let error = result.error_message().unwrap_or_default();
        if attempt >= policy.max_retries {
            warn!(
                attempts = attempt + 1,
                %error,
                rate_limited = result.is_rate_limited,
                "retries exhausted"
            );
            return result;
        }

        let delay = policy.backoff(attempt);
        warn!(
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            %error,
            rate_limited = result.is_rate_limited,
            "invocation failed, retrying"
        );
        metrics::retries().add(
            1,
            &[KeyValue::new("rate_limited", result.is_rate_limited)],
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
