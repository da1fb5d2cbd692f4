//! Bounded retry and fallback policy.
//!
//! Two layers:
//! - [`RetryExecutor`] retries one operation according to a [`RetryStrategy`] with exponential
//!   backoff, stopping early when the error says the same target will not recover.
//! - [`RetryPolicy`] walks an ordered candidate list (active adapter first, then fallbacks),
//!   giving each candidate one executor run. It knows nothing about adapters, so it can be
//!   tested with plain closures.
//!
//! # Usage
//!
//! ```ignore
//! let policy = RetryPolicy::default();
//! let success = policy
//!     .run_candidates(&candidates, |candidate, _index| async move {
//!         candidate.adapter.generate(&prompt, &options).await
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{GenError, Result, RetryStrategy};
use crate::pipeline::PipelineConfig;

/// Executor for retry logic with configurable backoff strategies.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    log_retries: bool,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new() -> Self {
        Self { log_retries: true }
    }

    /// Create a retry executor without logging.
    pub fn silent() -> Self {
        Self { log_retries: false }
    }

    /// Execute an async operation with retry based on `strategy`.
    ///
    /// Returns the result of the operation, or the last error if all attempts fail.
    pub async fn execute<F, Fut, T>(&self, strategy: &RetryStrategy, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match strategy {
            RetryStrategy::NoRetry | RetryStrategy::SwitchProvider => operation().await,
            RetryStrategy::ExponentialBackoff {
                base_delay,
                max_delay,
                max_attempts,
            } => {
                self.execute_exponential_backoff(*base_delay, *max_delay, *max_attempts, operation)
                    .await
            }
        }
    }

    /// Retry regardless of the error's own strategy.
    ///
    /// Used for collaborators (storage) whose errors carry no retry hint.
    pub async fn execute_always<F, Fut, T>(
        &self,
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
        mut operation: F,
    ) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = base_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(v) => return (Ok(v), attempts),
                Err(e) if attempts >= max_attempts.max(1) => {
                    if self.log_retries {
                        warn!("Operation failed after {} attempts: {}", attempts, e);
                    }
                    return (Err(e), attempts);
                }
                Err(e) => {
                    if self.log_retries {
                        warn!(
                            "Attempt {}/{} failed, retrying in {:?}: {}",
                            attempts, max_attempts, delay, e
                        );
                    }
                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    async fn execute_exponential_backoff<F, Fut, T>(
        &self,
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = base_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(v) => {
                    if attempts > 1 && self.log_retries {
                        info!("Operation succeeded after {} attempts", attempts);
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if attempts >= max_attempts {
                        if self.log_retries {
                            warn!(
                                "Operation failed after {} attempts, giving up: {}",
                                attempts, e
                            );
                        }
                        return Err(e);
                    }

                    // Only transient errors are worth another try on the same target.
                    if !matches!(e.retry_strategy(), RetryStrategy::ExponentialBackoff { .. }) {
                        if self.log_retries {
                            debug!("Error is not transient, stopping: {}", e);
                        }
                        return Err(e);
                    }

                    if self.log_retries {
                        warn!(
                            "Attempt {}/{} failed, retrying in {:?}: {}",
                            attempts, max_attempts, delay, e
                        );
                    }

                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }
}

/// Successful result of [`RetryPolicy::run_candidates`].
#[derive(Debug)]
pub struct CandidateSuccess<T> {
    /// Value produced by the winning candidate.
    pub value: T,
    /// Position of the winning candidate in the list.
    pub candidate_index: usize,
    /// Candidates tried, the winner included.
    pub attempts: u32,
}

/// Explicit bounded retry/fallback policy injected into the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Candidates tried after the active one.
    pub max_fallback_candidates: usize,
    /// Attempts on the same candidate for transient errors (1 = no same-target retry).
    pub same_candidate_attempts: u32,
    /// Initial backoff delay.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Attempts for the persist stage.
    pub persist_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_fallback_candidates: 2,
            same_candidate_attempts: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            persist_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Policy derived from the `[pipeline]` config section.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_fallback_candidates: config.fallback_candidates,
            same_candidate_attempts: config.same_adapter_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            persist_attempts: config.persist_attempts.max(1),
        }
    }

    /// Total number of candidates that may be tried.
    pub fn max_candidates(&self) -> usize {
        1 + self.max_fallback_candidates
    }

    fn same_candidate_strategy(&self) -> RetryStrategy {
        if self.same_candidate_attempts <= 1 {
            RetryStrategy::NoRetry
        } else {
            RetryStrategy::ExponentialBackoff {
                base_delay: self.base_delay,
                max_delay: self.max_delay,
                max_attempts: self.same_candidate_attempts,
            }
        }
    }

    /// Try candidates in order until one succeeds.
    ///
    /// Only recoverable errors advance to the next candidate; a permanent error is returned
    /// immediately. When every candidate fails the last error is returned.
    pub async fn run_candidates<C, T, F, Fut>(
        &self,
        candidates: &[C],
        mut attempt: F,
    ) -> Result<CandidateSuccess<T>>
    where
        F: FnMut(&C, usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let executor = RetryExecutor::new();
        let strategy = self.same_candidate_strategy();
        let mut last_error = None;
        let mut attempts = 0;

        for (index, candidate) in candidates.iter().take(self.max_candidates()).enumerate() {
            attempts += 1;
            match executor
                .execute(&strategy, || attempt(candidate, index))
                .await
            {
                Ok(value) => {
                    return Ok(CandidateSuccess {
                        value,
                        candidate_index: index,
                        attempts,
                    })
                }
                Err(e) if e.is_recoverable() => {
                    warn!(candidate = index, error = %e, "Candidate failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| GenError::ProviderNotFound("no generation candidates".to_string())))
    }
}
