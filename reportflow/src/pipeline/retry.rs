//! Antifragile retry with escalating output ceilings.
//!
//! Only transient structural failures (truncated or malformed output) are
//! retried, each time under the next ceiling of the [`CeilingSchedule`].
//! Everything else propagates after the first attempt. Usage of every
//! attempt, failed ones included, is summed.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::TokenUsage;
use crate::errors::{ChainError, ChainValidationError};

/// How the output ceiling changes between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CeilingSchedule {
    /// Same ceiling on every attempt.
    Fixed {
        /// The ceiling.
        tokens: u32,
    },
    /// `initial * factor^(attempt-1)`, capped at `max`.
    Escalating {
        /// Ceiling of the first attempt.
        initial: u32,
        /// Growth factor per attempt.
        factor: u32,
        /// Upper bound.
        max: u32,
    },
    /// One ceiling per attempt; the last repeats if attempts outnumber entries.
    Explicit {
        /// Ceilings in attempt order.
        ceilings: Vec<u32>,
    },
}

impl Default for CeilingSchedule {
    fn default() -> Self {
        Self::Escalating {
            initial: 8192,
            factor: 2,
            max: 32768,
        }
    }
}

impl CeilingSchedule {
    /// Ceiling for a 1-based attempt number.
    #[must_use]
    pub fn ceiling_for(&self, attempt: u32) -> u32 {
        let step = attempt.saturating_sub(1);
        match self {
            Self::Fixed { tokens } => *tokens,
            Self::Escalating {
                initial,
                factor,
                max,
            } => initial
                .saturating_mul(factor.saturating_pow(step))
                .min(*max),
            Self::Explicit { ceilings } => ceilings
                .get(step as usize)
                .or_else(|| ceilings.last())
                .copied()
                .unwrap_or(0),
        }
    }

    fn validate(&self) -> Result<(), ChainValidationError> {
        let ok = match self {
            Self::Fixed { tokens } => *tokens > 0,
            Self::Escalating {
                initial,
                factor,
                max,
            } => *initial > 0 && *factor >= 1 && max >= initial,
            Self::Explicit { ceilings } => !ceilings.is_empty() && ceilings.iter().all(|c| *c > 0),
        };
        if ok {
            Ok(())
        } else {
            Err(ChainValidationError::new(
                "CONFIG-CEILING-SCHEDULE",
                format!("invalid ceiling schedule: {self:?}"),
            )
            .with_fix_hint("Ceilings must be positive and an escalating max must be at least its initial value"))
        }
    }
}

/// Backoff strategy for the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt-1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied to the delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

/// Retry configuration for one stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Output ceiling per attempt.
    #[serde(default)]
    pub ceiling_schedule: CeilingSchedule,
    /// Base delay between attempts. Zero retries immediately.
    #[serde(default)]
    pub backoff_ms: u64,
    /// Delay cap.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            ceiling_schedule: CeilingSchedule::default(),
            backoff_ms: 0,
            max_backoff_ms: default_max_backoff_ms(),
            backoff_strategy: BackoffStrategy::default(),
            jitter_strategy: JitterStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the ceiling schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: CeilingSchedule) -> Self {
        self.ceiling_schedule = schedule;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_backoff_ms(mut self, delay: u64) -> Self {
        self.backoff_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Ceiling for a 1-based attempt number.
    #[must_use]
    pub fn ceiling_for(&self, attempt: u32) -> u32 {
        self.ceiling_schedule.ceiling_for(attempt)
    }

    /// Delay to wait after a failed 1-based attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms;
        let max = self.max_backoff_ms;
        let step = attempt.saturating_sub(1);

        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(step)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt.max(1))),
            BackoffStrategy::Constant => base,
        }
        .min(max);

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<(), ChainValidationError> {
        if self.max_attempts == 0 {
            return Err(ChainValidationError::new(
                "CONFIG-MAX-ATTEMPTS",
                "retry max_attempts must be at least 1",
            )
            .with_fix_hint("Use 1 to disable retries"));
        }
        self.ceiling_schedule.validate()
    }
}

/// One attempt handed to the work function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Output ceiling for the attempt.
    pub ceiling: u32,
}

/// A successful retried execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSummary<T> {
    /// The value of the successful attempt.
    pub value: T,
    /// Attempts made.
    pub attempts: u32,
    /// Usage summed over all attempts.
    pub usage: TokenUsage,
    /// Ceiling of each attempt, in order.
    pub ceilings: Vec<u32>,
}

/// A retried execution that gave up.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    /// The last error.
    pub error: ChainError,
    /// Attempts made.
    pub attempts: u32,
    /// Usage summed over all attempts.
    pub usage: TokenUsage,
    /// True if the attempts ran out on transient failures.
    pub exhausted: bool,
}

/// Runs `work` under `policy`.
///
/// `work` returns its value with the usage it consumed; a failed attempt
/// reports usage through [`ChainError::usage`].
pub async fn run_with_antifragile_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stage: &str,
    mut work: F,
) -> Result<AttemptSummary<T>, RetryFailure>
where
    F: FnMut(RetryAttempt) -> Fut,
    Fut: Future<Output = Result<(T, TokenUsage), ChainError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut usage = TokenUsage::default();
    let mut ceilings = Vec::with_capacity(max_attempts as usize);

    for number in 1..=max_attempts {
        let ceiling = policy.ceiling_for(number);
        ceilings.push(ceiling);

        match work(RetryAttempt { number, ceiling }).await {
            Ok((value, attempt_usage)) => {
                usage += attempt_usage;
                return Ok(AttemptSummary {
                    value,
                    attempts: number,
                    usage,
                    ceilings,
                });
            }
            Err(error) => {
                usage += error.usage();

                if !error.is_transient() {
                    debug!(stage, attempt = number, error = %error, "Non-retryable failure");
                    return Err(RetryFailure {
                        error,
                        attempts: number,
                        usage,
                        exhausted: false,
                    });
                }

                if number == max_attempts {
                    warn!(
                        stage,
                        attempts = number,
                        total_tokens = usage.total_tokens,
                        error = %error,
                        "Retries exhausted"
                    );
                    return Err(RetryFailure {
                        error,
                        attempts: number,
                        usage,
                        exhausted: true,
                    });
                }

                let delay = policy.delay_after(number);
                warn!(
                    stage,
                    attempt = number,
                    ceiling,
                    next_ceiling = policy.ceiling_for(number + 1),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Transient structural failure, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(RetryFailure {
        error: ChainError::Internal(format!("retry loop for stage '{stage}' made no attempt")),
        attempts: 0,
        usage,
        exhausted: true,
    })
}
