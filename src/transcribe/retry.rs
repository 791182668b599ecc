use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use super::error::{ErrorKind, TranscribeError};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Wait this long, then try again
    Retry(Duration),
    /// Give up and surface the error
    Abort,
}

/// Backoff schedule for transcription requests.
///
/// | failure             | wait before next attempt                                  |
/// |---------------------|-----------------------------------------------------------|
/// | payload too large   | none, abort                                               |
/// | service unavailable | `min(base * 2^n + U(0,5), max)`, +30s after 3 in a row     |
/// | rate limited        | `min(base * 2^n + U(0,1), max)`                           |
/// | anything else       | `base`                                                    |
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub unavailable_cooldown: Duration,
    pub cooldown_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            unavailable_cooldown: Duration::from_secs(30),
            cooldown_after: 3,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Wait before retrying after `attempt` (0-based) failed with `kind`.
    ///
    /// `consecutive_unavailable` counts the 503s seen in a row including this one.
    /// `jitter` is a sample from `[0, 1)`, scaled per error class.
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32, consecutive_unavailable: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(0.0, 1.0);
        match kind {
            ErrorKind::ServiceUnavailable => {
                let backoff = self.exponential(attempt, jitter * 5.0);
                if consecutive_unavailable >= self.cooldown_after {
                    backoff + self.unavailable_cooldown
                } else {
                    backoff
                }
            }
            ErrorKind::RateLimited => self.exponential(attempt, jitter),
            _ => self.base_delay,
        }
    }

    /// Decide whether attempt `attempt` (0-based) should be followed by another
    pub fn decide(&self, error: &TranscribeError, attempt: u32, consecutive_unavailable: u32, jitter: f64) -> RetryDecision {
        match error.kind() {
            ErrorKind::PayloadTooLarge | ErrorKind::Cancelled | ErrorKind::Exhausted => RetryDecision::Abort,
            _ if attempt + 1 >= self.max_retries => RetryDecision::Abort,
            kind => RetryDecision::Retry(self.delay_for(kind, attempt, consecutive_unavailable, jitter)),
        }
    }

    /// Run `attempt` until it succeeds, a fatal error occurs or retries run out.
    ///
    /// Exhaustion is reported as [`TranscribeError::ExhaustedRetries`] wrapping
    /// the last failure. Fatal errors are returned unchanged.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, TranscribeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TranscribeError>>,
    {
        let mut consecutive_unavailable = 0;
        let mut n = 0;

        loop {
            let error = match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.kind() == ErrorKind::ServiceUnavailable {
                consecutive_unavailable += 1;
            } else {
                consecutive_unavailable = 0;
            }

            match self.decide(&error, n, consecutive_unavailable, rand::random::<f64>()) {
                RetryDecision::Retry(wait) => {
                    tracing::warn!(
                        "Attempt {}/{} failed ({}), retrying in {:.1}s: {}",
                        n + 1,
                        self.max_retries,
                        error.kind(),
                        wait.as_secs_f64(),
                        error
                    );
                    sleep(wait).await;
                    n += 1;
                }
                RetryDecision::Abort => {
                    return Err(match error.kind() {
                        ErrorKind::PayloadTooLarge | ErrorKind::Cancelled | ErrorKind::Exhausted => error,
                        _ => TranscribeError::ExhaustedRetries {
                            attempts: n + 1,
                            last: Box::new(error),
                        },
                    });
                }
            }
        }
    }

    fn exponential(&self, attempt: u32, jitter_secs: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let backoff = self.base_delay.saturating_mul(factor) + Duration::from_secs_f64(jitter_secs);
        backoff.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe::client::{MockTranscriptionClient, TranscriptionClient};
    use crate::transcribe::tier::Tier;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn unavailable() -> TranscribeError {
        TranscribeError::ServiceUnavailable("503".into())
    }

    #[test]
    fn test_payload_too_large_aborts_immediately() {
        let policy = RetryPolicy::default();
        let err = TranscribeError::PayloadTooLarge { size_mb: 40.0, tier: Tier::Free };
        assert_eq!(policy.decide(&err, 0, 0, 0.5), RetryDecision::Abort);
    }

    #[test]
    fn test_backoff_schedule_is_non_decreasing() {
        let policy = RetryPolicy::default();
        let samples = [0.0, 0.25, 0.5, 0.75, 0.999];

        for kind in [ErrorKind::ServiceUnavailable, ErrorKind::RateLimited, ErrorKind::Transient] {
            for &early in &samples {
                for &late in &samples {
                    for attempt in 0..8 {
                        let a = policy.delay_for(kind, attempt, attempt + 1, early);
                        let b = policy.delay_for(kind, attempt + 1, attempt + 2, late);
                        assert!(b >= a, "{kind}: attempt {attempt} waited {a:?}, next {b:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_delays_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(ErrorKind::RateLimited, 10, 0, 0.9), Duration::from_secs(120));
        assert_eq!(
            policy.delay_for(ErrorKind::ServiceUnavailable, 10, 10, 0.9),
            Duration::from_secs(150)
        );
        assert_eq!(policy.delay_for(ErrorKind::Transient, 3, 0, 0.9), Duration::from_secs(5));
    }

    #[test]
    fn test_cooldown_after_third_unavailable() {
        let policy = RetryPolicy::default();
        let second = policy.delay_for(ErrorKind::ServiceUnavailable, 1, 2, 0.0);
        let third = policy.delay_for(ErrorKind::ServiceUnavailable, 2, 3, 0.0);
        assert_eq!(second, Duration::from_secs(10));
        assert_eq!(third, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_makes_zero_retries_on_payload_too_large() {
        let mut client = MockTranscriptionClient::new();
        client
            .expect_transcribe()
            .times(1)
            .returning(|_, _, _| Err(TranscribeError::PayloadTooLarge { size_mb: 30.0, tier: Tier::Free }));

        let policy = RetryPolicy::default();
        let result = policy.run(|_| client.transcribe(Vec::new(), "chunk_0.mp3", "en")).await;

        assert!(matches!(result, Err(TranscribeError::PayloadTooLarge { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_after_max_retries() {
        let mut client = MockTranscriptionClient::new();
        client
            .expect_transcribe()
            .times(5)
            .returning(|_, _, _| Err(TranscribeError::RateLimited("429".into())));

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let policy = RetryPolicy::default();
        let result = policy
            .run(|_| {
                attempts.lock().unwrap().push(Instant::now());
                client.transcribe(Vec::new(), "chunk_0.mp3", "en")
            })
            .await;

        match result {
            Err(TranscribeError::ExhaustedRetries { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last, TranscribeError::RateLimited(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let times = attempts.lock().unwrap();
        let waits: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(waits.len(), 4);
        assert!(waits.windows(2).all(|w| w[1] >= w[0]), "waits not monotone: {waits:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_after_unavailable() {
        let calls = Arc::new(Mutex::new(0u32));
        let policy = RetryPolicy::default();

        let result = policy
            .run(|_| {
                let calls = calls.clone();
                async move {
                    let mut calls = calls.lock().unwrap();
                    *calls += 1;
                    if *calls < 4 {
                        Err(unavailable())
                    } else {
                        Ok("hello".to_string())
                    }
                }
            })
            .await;

        tokio_test::assert_ok!(&result);
        assert_eq!(result.unwrap(), "hello");
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_wait_base_delay() {
        let start = Instant::now();
        let policy = RetryPolicy::default().with_max_retries(3);

        let result: Result<String, _> = policy
            .run(|_| async { Err(TranscribeError::Network("reset".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}
