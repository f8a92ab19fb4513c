//! Retry with exponential backoff for create-class control-plane calls.
//!
//! Errors are classified by a case-insensitive substring match of their
//! control-plane message against the policy's retryable patterns. Anything
//! that does not match is fatal and is returned after a single attempt.
//!
//! # Example
//!
//! ```rust,ignore
//! use virtbench::retry::{RetryEngine, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_secs(2))
//!     .backoff_multiplier(2.0)
//!     .build();
//!
//! let engine = RetryEngine::new(observer, cancel.clone());
//! let created = engine
//!     .execute(&policy, "create bench-1/vm", || controller.create(&target, &spec))
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::telemetry::{RetryEvent, SharedObserver};

/// Messages the control plane produces for failures that go away on retry.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "context deadline exceeded",
    "deadline exceeded",
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "internal error",
    "internalerror",
    "webhook",
    "the object has been modified",
    "operation cannot be fulfilled",
    "tls handshake timeout",
    "i/o timeout",
    "etcdserver: request timed out",
];

/// How an error is matched against a [`RetryPolicy`].
///
/// The engine reports the full [`Display`](fmt::Display) text to the
/// observer but only classifies what [`is_retryable`](Self::is_retryable)
/// looks at.
pub trait RetryClassify: fmt::Display {
    fn is_retryable(&self, policy: &RetryPolicy) -> bool;
}

impl RetryClassify for Error {
    fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        self.is_transient(policy)
    }
}

impl RetryClassify for &str {
    fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        policy.is_retryable(self)
    }
}

impl RetryClassify for String {
    fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        policy.is_retryable(self)
    }
}

/// Retry parameters. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    retryable_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            retryable_patterns: DEFAULT_RETRYABLE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::builder().max_attempts(1).build()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn retryable_patterns(&self) -> &[String] {
        &self.retryable_patterns
    }

    /// Whether an error message is retryable under this policy.
    pub fn is_retryable(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.retryable_patterns.iter().any(|p| lower.contains(p))
    }

    /// Delay before the k-th retry (1-indexed): `initial * multiplier^(k-1)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        self.initial_delay
            .mul_f64(self.backoff_multiplier.powi(exponent))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }

    /// Total attempts including the first one. Clamped to at least 1.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.policy.max_attempts = n.max(1);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    /// Replace the pattern vocabulary.
    pub fn retryable_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.policy.retryable_patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().to_lowercase())
            .collect();
        self
    }

    /// Append to the pattern vocabulary.
    pub fn add_retryable_pattern(mut self, pattern: impl AsRef<str>) -> Self {
        self.policy
            .retryable_patterns
            .push(pattern.as_ref().to_lowercase());
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the retry engine gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error did not match any retryable pattern.
    Fatal {
        attempts: u32,
        last_error: E,
    },

    /// Every attempt failed with a retryable error.
    Exhausted {
        attempts: u32,
        last_error: E,
    },

    /// Cancellation was requested before the next attempt.
    Cancelled {
        attempts: u32,
        last_error: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts performed.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Fatal { last_error, .. } | RetryError::Exhausted { last_error, .. } => {
                Some(last_error)
            }
            RetryError::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Fatal { attempts, last_error } => {
                write!(f, "Non-retryable error after {} attempt(s): {}", attempts, last_error)
            }
            RetryError::Exhausted { attempts, last_error } => {
                write!(f, "Retries exhausted after {} attempts. Last error: {}", attempts, last_error)
            }
            RetryError::Cancelled { attempts, last_error } => {
                write!(
                    f,
                    "Cancelled after {} attempt(s){}",
                    attempts,
                    last_error
                        .as_ref()
                        .map(|e| format!(". Last error: {}", e))
                        .unwrap_or_default()
                )
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_error().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl RetryError<Error> {
    /// Collapse into the crate error, keeping the operation label.
    pub fn into_error(self, operation: &str) -> Error {
        match self {
            RetryError::Cancelled { .. } => Error::Cancelled(operation.to_string()),
            RetryError::Fatal { attempts, last_error } | RetryError::Exhausted { attempts, last_error } => {
                Error::RetryExhausted {
                    operation: operation.to_string(),
                    attempts,
                    message: last_error.to_string(),
                }
            }
        }
    }
}

/// Executes operations under a [`RetryPolicy`].
///
/// Backoff sleeps race against the cancellation token; an in-flight call is
/// never aborted, only the next attempt is skipped.
#[derive(Clone)]
pub struct RetryEngine {
    observer: SharedObserver,
    cancel: CancellationToken,
}

impl RetryEngine {
    pub fn new(observer: SharedObserver, cancel: CancellationToken) -> Self {
        Self { observer, cancel }
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        label: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify,
    {
        if self.cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: 0,
                last_error: None,
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let message = error.to_string();

            if !error.is_retryable(policy) {
                self.observer.on_fatal(label, attempt, &message);
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    last_error: error,
                });
            }

            if attempt >= policy.max_attempts() {
                self.observer.on_fatal(label, attempt, &message);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = policy.delay_for_retry(attempt);
            self.observer.on_retry(&RetryEvent {
                operation: label,
                attempt,
                max_attempts: policy.max_attempts(),
                delay,
                error: &message,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        last_error: Some(error),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{BenchmarkObserver, NullObserver};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingObserver {
        delays: Mutex<Vec<Duration>>,
        fatal: AtomicU32,
    }

    impl BenchmarkObserver for RecordingObserver {
        fn on_retry(&self, event: &RetryEvent<'_>) {
            self.delays.lock().push(event.delay);
        }

        fn on_fatal(&self, _operation: &str, _attempts: u32, _error: &str) {
            self.fatal.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine(observer: SharedObserver) -> RetryEngine {
        RetryEngine::new(observer, CancellationToken::new())
    }

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(2))
            .backoff_multiplier(2.0)
            .build();
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_retry(4), Duration::from_secs(16));
    }

    #[test]
    fn test_pattern_matching_is_case_insensitive() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable("Internal error occurred: failed calling webhook"));
        assert!(policy.is_retryable("Operation cannot be fulfilled on virtualmachines"));
        assert!(policy.is_retryable("net/http: TLS handshake timeout"));
        assert!(policy.is_retryable("dial tcp: i/o timeout"));
        assert!(!policy.is_retryable("Unauthorized"));
        assert!(!policy.is_retryable("virtualmachines.kubevirt.io \"vm\" already exists"));
    }

    #[test]
    fn test_custom_patterns_replace_vocabulary() {
        let policy = RetryPolicy::builder()
            .retryable_patterns(["Quota Exceeded"])
            .build();
        assert!(policy.is_retryable("quota exceeded for pods"));
        assert!(!policy.is_retryable("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_uses_all_attempts_with_exact_backoff() {
        let observer = Arc::new(RecordingObserver::default());
        let engine = engine(observer.clone());
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .initial_delay(Duration::from_secs(3))
            .backoff_multiplier(2.0)
            .build();

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let recorded = attempts.clone();
        let result: Result<(), _> = engine
            .execute(&policy, "create", || {
                recorded.lock().push(Instant::now());
                async { Err::<(), _>("connection refused") }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));

        let times = attempts.lock().clone();
        assert_eq!(times.len(), 4);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(12)
            ]
        );
        assert_eq!(*observer.delays.lock(), gaps);
        assert_eq!(observer.fatal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_single_attempt() {
        let engine = engine(Arc::new(NullObserver));
        let policy = RetryPolicy::builder().max_attempts(10).build();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = engine
            .execute(&policy, "create", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("forbidden: no permission") }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_name_is_not_classified() {
        let observer = Arc::new(RecordingObserver::default());
        let engine = engine(observer.clone());
        let policy = RetryPolicy::builder().max_attempts(4).build();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = engine
            .execute(&policy, "create timeout-lab-1/rhel-9-vm", || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::control_plane(
                        "create",
                        "timeout-lab-1/rhel-9-vm",
                        "forbidden: quota exceeded",
                    ))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(observer.delays.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_patterns_apply_to_control_plane_errors() {
        let engine = engine(Arc::new(NullObserver));
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .add_retryable_pattern("quota exceeded")
            .build();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = engine
            .execute(&policy, "create", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::control_plane("create", "bench-1/vm", "forbidden: quota exceeded")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let engine = engine(Arc::new(NullObserver));
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_millis(100))
            .build();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = engine
            .execute(&policy, "create", || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("etcdserver: request timed out")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_skips_next_attempt() {
        let cancel = CancellationToken::new();
        let engine = RetryEngine::new(Arc::new(NullObserver), cancel.clone());
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_secs(60))
            .build();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = engine
            .execute(&policy, "create", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("timeout") }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = RetryEngine::new(Arc::new(NullObserver), cancel);
        let result: Result<(), RetryError<&str>> = engine
            .execute(&RetryPolicy::default(), "create", || async { Ok(()) })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::Cancelled { attempts: 0, last_error: None })
        ));
    }

    #[test]
    fn test_into_error() {
        let err: RetryError<Error> = RetryError::Exhausted {
            attempts: 5,
            last_error: Error::control_plane("create", "ns/vm", "timeout"),
        };
        let converted = err.into_error("create ns/vm");
        assert!(matches!(converted, Error::RetryExhausted { attempts: 5, .. }));
    }
}
