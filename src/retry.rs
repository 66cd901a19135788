//! Backoff for Kubernetes API calls made by the one-shot jobs
//!
//! The certificate and cleanup jobs run once per invocation, so an API
//! server hiccup would otherwise fail the whole run. [`call_api`] retries a
//! call while its error is transient ([`is_transient`]) and hands every
//! other error straight back: a conflict or a rejected patch is a verdict
//! about the request, and sending the same request again cannot change it.
//!
//! ```ignore
//! use appmon::retry::{call_api, Backoff};
//!
//! let secret = call_api(&Backoff::API_CALLS, "get_certificate_secret", || {
//!     secrets.get_opt("app-monitoring-webhook-cert")
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Bounded exponential backoff schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Total number of calls, the first one included
    pub attempts: u32,
    /// Nominal delay after the first failure; doubles after each further one
    pub initial_delay: Duration,
    /// Cap on the nominal delay
    pub max_delay: Duration,
}

impl Backoff {
    /// Six calls spread over roughly half a minute
    pub const API_CALLS: Backoff = Backoff {
        attempts: 6,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(10),
    };

    /// Nominal delay after the `failures`-th consecutive failure (1-based)
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }
}

/// Whether retrying the same call could succeed
///
/// Throttling (429), server-side failures (5xx) and transport errors are
/// transient. Every other API status, 409 conflicts included, is final.
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => response.code == 429 || response.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

/// Run an API call, retrying transient failures according to `backoff`
///
/// Returns the first final error, or the last transient one once the
/// attempts are exhausted. `operation` only labels the log events.
pub async fn call_api<F, Fut, T>(
    backoff: &Backoff,
    operation: &str,
    mut call: F,
) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut failures = 0u32;

    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        failures += 1;

        if !is_transient(&err) {
            error!(%operation, error = %err, "API call rejected");
            return Err(err);
        }
        if failures >= backoff.attempts {
            error!(%operation, attempts = failures, error = %err, "API call failed after retries");
            return Err(err);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = backoff.nominal_delay(failures).mul_f64(jitter);
        warn!(
            %operation,
            attempt = failures,
            error = %err,
            delay_ms = delay.as_millis(),
            "API call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    #[rstest]
    #[case::conflict(409, false)]
    #[case::not_found(404, false)]
    #[case::invalid(422, false)]
    #[case::forbidden(403, false)]
    #[case::throttled(429, true)]
    #[case::internal(500, true)]
    #[case::unavailable(503, true)]
    fn test_api_status_classification(#[case] code: u16, #[case] transient: bool) {
        assert_eq!(is_transient(&api_error(code)), transient);
    }

    #[test]
    fn test_nominal_delay_doubles_up_to_cap() {
        let backoff = Backoff::API_CALLS;
        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(500));
        assert_eq!(backoff.nominal_delay(2), Duration::from_secs(1));
        assert_eq!(backoff.nominal_delay(4), Duration::from_secs(4));
        assert_eq!(backoff.nominal_delay(6), Duration::from_secs(10));
        assert_eq!(backoff.nominal_delay(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);

        let result = call_api(&Backoff::API_CALLS, "get", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(api_error(503))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn story_conflict_is_not_replayed() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = call_api(&Backoff::API_CALLS, "patch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(api_error(409)) }
        })
        .await;

        assert!(matches!(result, Err(kube::Error::Api(ref r)) if r.code == 409));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff {
            attempts: 3,
            ..Backoff::API_CALLS
        };

        let result: Result<(), _> = call_api(&backoff, "list", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(api_error(500)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
