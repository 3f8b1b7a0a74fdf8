//! Token usage accounting.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Token usage reported by one or more generation calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Total tokens (usually input + output).
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Creates usage where the total is the sum of input and output.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Returns true if nothing was consumed.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens.saturating_add(rhs.input_tokens),
            output_tokens: self.output_tokens.saturating_add(rhs.output_tokens),
            total_tokens: self.total_tokens.saturating_add(rhs.total_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, u| acc + u)
    }
}

/// Usage recorded against a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Stage name.
    pub stage: String,
    /// Usage attributed to the stage so far.
    pub usage: TokenUsage,
    /// True once the stage's checkpointed usage has been added.
    #[serde(default)]
    pub checkpointed: bool,
}

/// Per-stage usage plus a running total.
///
/// Checkpointed usage is charged at most once per stage, so replaying a
/// checkpoint after a restart never double-counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedger {
    entries: Vec<UsageEntry>,
    total: TokenUsage,
}

impl UsageLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Running total across all stages.
    #[must_use]
    pub fn total(&self) -> TokenUsage {
        self.total
    }

    /// Per-stage entries in first-charged order.
    #[must_use]
    pub fn entries(&self) -> &[UsageEntry] {
        &self.entries
    }

    /// Usage recorded for a stage.
    #[must_use]
    pub fn stage_usage(&self, stage: &str) -> Option<TokenUsage> {
        self.entry(stage).map(|e| e.usage)
    }

    /// Returns true if the stage's checkpoint has been charged.
    #[must_use]
    pub fn is_checkpoint_charged(&self, stage: &str) -> bool {
        self.entry(stage).is_some_and(|e| e.checkpointed)
    }

    /// Charges the usage of a successful, checkpointed stage execution.
    ///
    /// Returns false (and changes nothing) if this stage was already charged.
    pub fn charge_checkpoint(&mut self, stage: &str, usage: TokenUsage) -> bool {
        let entry = self.entry_mut(stage);
        if entry.checkpointed {
            return false;
        }
        entry.checkpointed = true;
        entry.usage += usage;
        self.total += usage;
        true
    }

    /// Charges usage that produced no checkpoint (failed attempts, clarification requests).
    pub fn charge_attempts(&mut self, stage: &str, usage: TokenUsage) {
        if usage.is_zero() {
            return;
        }
        self.entry_mut(stage).usage += usage;
        self.total += usage;
    }

    fn entry(&self, stage: &str) -> Option<&UsageEntry> {
        self.entries.iter().find(|e| e.stage == stage)
    }

    fn entry_mut(&mut self, stage: &str) -> &mut UsageEntry {
        let idx = match self.entries.iter().position(|e| e.stage == stage) {
            Some(idx) => idx,
            None => {
                self.entries.push(UsageEntry {
                    stage: stage.to_string(),
                    usage: TokenUsage::default(),
                    checkpointed: false,
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_usage_addition() {
        let a = TokenUsage::new(10, 20);
        let b = TokenUsage::new(1, 2);
        assert_eq!(a + b, TokenUsage::new(11, 22));

        let total: TokenUsage = vec![a, b, b].into_iter().sum();
        assert_eq!(total.total_tokens, 36);
    }

    #[test]
    fn test_checkpoint_charged_once() {
        let mut ledger = UsageLedger::new();
        assert!(ledger.charge_checkpoint("analysis", TokenUsage::new(100, 50)));
        assert!(!ledger.charge_checkpoint("analysis", TokenUsage::new(100, 50)));

        assert_eq!(ledger.total().total_tokens, 150);
        assert!(ledger.is_checkpoint_charged("analysis"));
    }

    #[test]
    fn test_attempts_and_checkpoint_accumulate_per_stage() {
        let mut ledger = UsageLedger::new();
        ledger.charge_attempts("analysis", TokenUsage::new(10, 10));
        ledger.charge_checkpoint("analysis", TokenUsage::new(5, 5));
        ledger.charge_checkpoint("report", TokenUsage::new(1, 1));

        assert_eq!(ledger.stage_usage("analysis"), Some(TokenUsage::new(15, 15)));
        assert_eq!(ledger.entries().len(), 2);
        assert_eq!(ledger.total(), TokenUsage::new(16, 16));
    }

    #[test]
    fn test_zero_attempt_usage_creates_no_entry() {
        let mut ledger = UsageLedger::new();
        ledger.charge_attempts("analysis", TokenUsage::default());
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn test_ledger_serialize_roundtrip_keeps_checkpoint_flag() {
        let mut ledger = UsageLedger::new();
        ledger.charge_checkpoint("a", TokenUsage::new(3, 4));
        let json = serde_json::to_string(&ledger).unwrap();
        let back: UsageLedger = serde_json::from_str(&json).unwrap();
        assert!(back.is_checkpoint_charged("a"));
        assert_eq!(back, ledger);
    }
}
