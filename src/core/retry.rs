//! Retry policy applied to every fallible remote call.
//!
//! A failure is retried only when the classifier recognises it as
//! transient. Once attempts run out, the last underlying error is returned
//! unchanged.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::classifier::{Classification, RetryClassifier};

/// Retry settings as they appear in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u64,

    /// Backoff multiplier (delay *= multiplier after each retry); fixed delay when unset
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,

    /// Upper bound for backed-off delays in seconds
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,
}

fn default_max_attempts() -> u32 {
    60
}
fn default_delay_seconds() -> u64 {
    60
}
fn default_max_delay_seconds() -> u64 {
    600
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_seconds: default_delay_seconds(),
            backoff_multiplier: None,
            max_delay_seconds: default_max_delay_seconds(),
        }
    }
}

/// Stateless, shareable retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    classifier: Arc<RetryClassifier>,

    pub max_attempts: u32,

    pub delay: Duration,

    pub backoff_multiplier: Option<f64>,

    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed-delay policy
    pub fn new(classifier: Arc<RetryClassifier>, max_attempts: u32, delay: Duration) -> Self {
        Self {
            classifier,
            max_attempts: max_attempts.max(1),
            delay,
            backoff_multiplier: None,
            max_delay: delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings, classifier: Arc<RetryClassifier>) -> Self {
        Self {
            classifier,
            max_attempts: settings.max_attempts.max(1),
            delay: Duration::from_secs(settings.delay_seconds),
            backoff_multiplier: settings.backoff_multiplier,
            max_delay: Duration::from_secs(settings.max_delay_seconds.max(settings.delay_seconds)),
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self::new(Arc::new(RetryClassifier::fail_closed()), 1, Duration::ZERO)
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self.max_delay = max_delay;
        self
    }

    pub fn classifier(&self) -> &RetryClassifier {
        &self.classifier
    }

    /// Delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(multiplier) = self.backoff_multiplier else {
            return self.delay;
        };
        if attempt <= 1 {
            return self.delay;
        }

        let delay = self.delay.as_millis() as f64 * multiplier.powi((attempt - 1) as i32);
        let capped = delay.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `call` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `call` receives the 1-indexed attempt number.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let e = match call(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let reason = match self.classifier.classify_error(&e) {
                Classification::Fatal => return Err(e),
                Classification::Transient { reason } => reason,
            };

            if !self.should_retry(attempt) {
                error!(operation, attempt, %reason, error = %e, "Transient error persisted, giving up");
                return Err(e);
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %reason,
                error = %e,
                "Transient error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{PatternTable, TransientPattern};

    fn classifier() -> Arc<RetryClassifier> {
        let table = PatternTable {
            version: 1,
            patterns: vec![TransientPattern::new("try again", "flaky")],
        };
        Arc::new(RetryClassifier::compile(&table).unwrap())
    }

    #[test]
    fn test_default_settings() {
        let settings = RetrySettings::default();
        assert_eq!(settings.max_attempts, 60);
        assert_eq!(settings.delay_seconds, 60);
        assert!(settings.backoff_multiplier.is_none());
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(classifier(), 5, Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::new(classifier(), 6, Duration::from_millis(1000))
            .with_backoff(2.0, Duration::from_millis(10000));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(classifier(), 3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let settings = RetrySettings {
            max_attempts: 0,
            ..Default::default()
        };
        let policy = RetryPolicy::from_settings(&settings, classifier());
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let policy = RetryPolicy::new(classifier(), 5, Duration::from_secs(1));
        let mut calls = 0;

        let result: Result<(), String> = policy
            .run("op", |_| {
                calls += 1;
                async { Err("permission denied".to_string()) }
            })
            .await;

        assert_eq!(result.unwrap_err(), "permission denied");
        assert_eq!(calls, 1);
    }
}
