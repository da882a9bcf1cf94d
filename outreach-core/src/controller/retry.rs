use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::config::RetrySection;

use super::clock::Clock;
use super::error::ControllerError;
use super::error_handler::{ErrorCategorizer, ErrorClassification};

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

/// The last failure of a retried operation, untouched, plus how the loop
/// judged it. `escalated` is set when a retryable signal recurred until it
/// was promoted to Fatal.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: ControllerError,
    pub classification: ErrorClassification,
    pub attempts: usize,
    pub escalated: bool,
}

impl RetryFailure {
    pub fn into_error(self) -> ControllerError {
        self.error
    }
}

/// Classifies failures and drives the bounded retry loop around a single
/// action.
pub struct RetryClassifier {
    max_attempts: usize,
    initial_delay: Duration,
    factor: f64,
    max_delay: Duration,
    jitter_fraction: f64,
    clock: Arc<dyn Clock>,
    rng: Mutex<ChaCha8Rng>,
}

impl RetryClassifier {
    pub fn new(config: RetrySection, clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(config, clock, ChaCha8Rng::from_entropy())
    }

    pub fn with_seed(config: RetrySection, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::with_rng(config, clock, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(config: RetrySection, clock: Arc<dyn Clock>, rng: ChaCha8Rng) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            factor: config.factor.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_fraction: config.jitter_fraction.clamp(0.0, 0.99),
            clock,
            rng: Mutex::new(rng),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn ceiling(&self) -> u32 {
        u32::try_from(self.max_attempts).unwrap_or(u32::MAX)
    }

    /// First-occurrence classification of a raw failure signal.
    pub fn classify(&self, signal: &str) -> ErrorClassification {
        ErrorCategorizer::classify(signal, 1, self.ceiling())
    }

    pub fn classify_occurrence(&self, signal: &str, occurrence: u32) -> ErrorClassification {
        ErrorCategorizer::classify(signal, occurrence, self.ceiling())
    }

    pub fn classify_error(&self, error: &ControllerError, occurrence: u32) -> ErrorClassification {
        ErrorCategorizer::categorize(error, occurrence, self.ceiling())
    }

    /// Un-jittered exponential delay for a 1-based attempt.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.jitter_fraction <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(-self.jitter_fraction..=self.jitter_fraction),
            Err(_) => 0.0,
        };
        base.mul_f64(1.0 + spread)
    }

    pub async fn with_retry<F, Fut, T>(
        &self,
        label: &str,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, ControllerError>>,
    {
        let mut attempt = 0usize;
        let mut occurrences: HashMap<String, u32> = HashMap::new();
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    attempt += 1;
                    let seen = occurrences.entry(signal_key(&error)).or_insert(0);
                    *seen = seen.saturating_add(1);
                    let occurrence = *seen;
                    let classification = self.classify_error(&error, occurrence);
                    match classification {
                        ErrorClassification::Silent => {
                            debug!(label, attempt, error = %error, "silent failure")
                        }
                        _ => warn!(label, attempt, ?classification, error = %error, "operation failed"),
                    }
                    if !classification.is_retryable() || attempt >= self.max_attempts {
                        let escalated = classification == ErrorClassification::Fatal
                            && self.classify_error(&error, 1).is_retryable();
                        return Err(RetryFailure {
                            error,
                            classification,
                            attempts: attempt,
                            escalated,
                        });
                    }
                    let delay = self.compute_backoff(u32::try_from(attempt).unwrap_or(u32::MAX));
                    debug!(label, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
                    self.clock.sleep(delay).await;
                }
            }
        }
    }
}

/// Failures differing only in numbers (ids, ports, counters) count as the
/// same signal.
fn signal_key(error: &ControllerError) -> String {
    let mut key = String::new();
    let mut in_digits = false;
    for ch in error.to_string().chars() {
        if ch.is_ascii_digit() {
            if !in_digits {
                key.push('#');
            }
            in_digits = true;
        } else {
            key.push(ch);
            in_digits = false;
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn classifier(max_attempts: usize, jitter: f64) -> (RetryClassifier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap(),
        ));
        let retry = RetryClassifier::with_seed(
            RetrySection {
                max_attempts,
                initial_delay_ms: 1_000,
                factor: 2.0,
                max_delay_ms: 5_000,
                jitter_fraction: jitter,
            },
            clock.clone(),
            42,
        );
        (retry, clock)
    }

    #[test]
    fn classify_reference_signals() {
        let (retry, _) = classifier(3, 0.0);
        assert_eq!(
            retry.classify("net::ERR_CONNECTION_RESET"),
            ErrorClassification::Silent
        );
        assert_eq!(retry.classify("status of 429"), ErrorClassification::RateLimited);
        assert_eq!(
            retry.classify("unknown xyz failure"),
            ErrorClassification::Transient
        );
        assert_eq!(
            retry.classify_occurrence("unknown xyz failure", 4),
            ErrorClassification::Fatal
        );
    }

    #[test]
    fn backoff_grows_exponentially_until_cap() {
        let (retry, _) = classifier(5, 0.0);
        assert_eq!(retry.compute_backoff(1), Duration::from_secs(1));
        assert_eq!(retry.compute_backoff(2), Duration::from_secs(2));
        assert_eq!(retry.compute_backoff(3), Duration::from_secs(4));
        assert_eq!(retry.compute_backoff(4), Duration::from_secs(5));
        assert_eq!(retry.compute_backoff(30), Duration::from_secs(5));
    }

    #[test]
    fn jitter_is_symmetric_and_bounded() {
        let (retry, _) = classifier(5, 0.25);
        for _ in 0..100 {
            let delay = retry.compute_backoff(2).as_secs_f64();
            assert!((1.5..=2.5).contains(&delay), "delay {delay} outside jitter band");
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let (retry, clock) = classifier(3, 0.0);
        let calls = AtomicUsize::new(0);
        let outcome = retry
            .with_retry("connect", |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(ControllerError::Action("unknown xyz failure".into()))
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.result, "sent");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn exhausted_transient_failure_is_fatal_and_propagates_last_error() {
        let (retry, clock) = classifier(3, 0.0);
        let calls = AtomicUsize::new(0);
        let failure = retry
            .with_retry("connect", |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err::<(), _>(ControllerError::Action(format!("unknown xyz failure #{call}")))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.classification, ErrorClassification::Fatal);
        assert!(failure.escalated);
        assert_eq!(
            failure.into_error().to_string(),
            "action failed: unknown xyz failure #2"
        );
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn rate_limited_failure_is_not_retried() {
        let (retry, clock) = classifier(3, 0.0);
        let calls = AtomicUsize::new(0);
        let failure = retry
            .with_retry("message", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ControllerError::Action("status of 429".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.classification, ErrorClassification::RateLimited);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn silent_failures_stay_silent_when_exhausted() {
        let (retry, _) = classifier(2, 0.0);
        let failure = retry
            .with_retry("connect", |_| async {
                Err::<(), _>(ControllerError::Action("net::ERR_CONNECTION_RESET".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.classification, ErrorClassification::Silent);
    }

    #[tokio::test]
    async fn distinct_unmatched_signals_stay_transient_when_exhausted() {
        let (retry, _) = classifier(3, 0.0);
        let calls = AtomicUsize::new(0);
        let failure = retry
            .with_retry("connect", |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let message = if call % 2 == 0 { "odd page layout" } else { "empty reply" };
                    Err::<(), _>(ControllerError::Action(message.into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.classification, ErrorClassification::Transient);
        assert!(!failure.escalated);
    }

    #[tokio::test]
    async fn typed_fatal_error_is_not_marked_escalated() {
        let (retry, clock) = classifier(3, 0.0);
        let failure = retry
            .with_retry("connect", |_| async {
                Err::<(), _>(ControllerError::AuthenticationLost("cookie gone".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.classification, ErrorClassification::Fatal);
        assert!(!failure.escalated);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn signal_key_ignores_numbers() {
        assert_eq!(
            signal_key(&ControllerError::Action("request 1234 failed on port 80".into())),
            signal_key(&ControllerError::Action("request 99 failed on port 8080".into()))
        );
    }
}
