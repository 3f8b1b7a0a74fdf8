//! Orchestrator configuration.
//!
//! Configuration is plain serde data with defaults for every field, so a
//! partial JSON document or a handful of `REPORTFLOW_*` environment variables
//! is enough to override what matters.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{ChainError, ChainValidationError};
use crate::pipeline::RetryPolicy;

/// Prefix of every environment variable read by [`OrchestratorConfig::from_env`].
pub const ENV_PREFIX: &str = "REPORTFLOW_";

/// Default generation parameters for stage calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    /// Output ceiling used when a stage runs outside the retry schedule.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Bound on a single generation call, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_output_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl GenerationDefaults {
    /// Request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Ceiling on cumulative tokens per run. `None` means unlimited.
    #[serde(default)]
    pub budget_ceiling_tokens: Option<u64>,
    /// Retry behavior for transient structural failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How long a clarification waits for an answer.
    #[serde(default = "default_clarification_timeout_secs")]
    pub clarification_timeout_secs: u64,
    /// Generation parameters.
    #[serde(default)]
    pub generation: GenerationDefaults,
    /// Whether progress is persisted around each stage.
    #[serde(default = "default_progress_enabled")]
    pub progress_enabled: bool,
}

fn default_clarification_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_progress_enabled() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            budget_ceiling_tokens: None,
            retry: RetryPolicy::default(),
            clarification_timeout_secs: default_clarification_timeout_secs(),
            generation: GenerationDefaults::default(),
            progress_enabled: default_progress_enabled(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the budget ceiling.
    #[must_use]
    pub fn with_budget_ceiling(mut self, tokens: u64) -> Self {
        self.budget_ceiling_tokens = Some(tokens);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the clarification timeout.
    #[must_use]
    pub fn with_clarification_timeout_secs(mut self, secs: u64) -> Self {
        self.clarification_timeout_secs = secs;
        self
    }

    /// Sets the generation defaults.
    #[must_use]
    pub fn with_generation(mut self, generation: GenerationDefaults) -> Self {
        self.generation = generation;
        self
    }

    /// Enables or disables progress persistence.
    #[must_use]
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress_enabled = enabled;
        self
    }

    /// Clarification timeout as a chrono duration.
    #[must_use]
    pub fn clarification_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.clarification_timeout_secs).unwrap_or(i64::MAX))
    }

    /// Parses a JSON document, filling missing fields with defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ChainError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads overrides from `REPORTFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ChainError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, which receives the full variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u64, _>(&lookup, "BUDGET_CEILING_TOKENS")? {
            config.budget_ceiling_tokens = Some(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CLARIFICATION_TIMEOUT_SECS")? {
            config.clarification_timeout_secs = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "MAX_OUTPUT_TOKENS")? {
            config.generation.max_output_tokens = v;
        }
        if let Some(v) = parse_var::<f32, _>(&lookup, "TEMPERATURE")? {
            config.generation.temperature = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ChainValidationError> {
        self.retry.validate()?;

        if self.budget_ceiling_tokens == Some(0) {
            return Err(ChainValidationError::new(
                "CONFIG-BUDGET",
                "budget ceiling of 0 tokens would fail every run",
            )
            .with_fix_hint("Omit budget_ceiling_tokens for an unlimited budget"));
        }
        if self.clarification_timeout_secs == 0 {
            return Err(ChainValidationError::new(
                "CONFIG-CLARIFICATION-TIMEOUT",
                "clarification timeout must be positive",
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ChainValidationError::new(
                "CONFIG-TEMPERATURE",
                format!("temperature {} is outside 0.0..=2.0", self.generation.temperature),
            ));
        }
        if self.generation.request_timeout_secs == 0 {
            return Err(ChainValidationError::new(
                "CONFIG-REQUEST-TIMEOUT",
                "request timeout must be positive",
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ChainValidationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{ENV_PREFIX}{name}");
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ChainValidationError::new("CONFIG-ENV", format!("{key}={raw:?} is invalid: {e}"))
        }),
    }
}
