//! Cross-stage usage budget.

use tracing::{debug, warn};

use crate::core::{TokenUsage, UsageLedger};
use crate::errors::ChainError;

/// Enforces a ceiling on cumulative run usage at stage boundaries.
///
/// A stage that overshoots mid-execution is not interrupted; the run fails
/// before the next stage starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetGuard {
    ceiling: Option<u64>,
}

impl BudgetGuard {
    /// Creates a guard. `None` disables enforcement.
    #[must_use]
    pub fn new(ceiling: Option<u64>) -> Self {
        Self { ceiling }
    }

    /// The configured ceiling.
    #[must_use]
    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    /// Charges a completed stage's usage and checks the running total.
    ///
    /// The charge is idempotent per stage, so replaying a checkpoint does
    /// not count its usage twice.
    pub fn check(
        &self,
        ledger: &mut UsageLedger,
        delta: TokenUsage,
        stage: &str,
    ) -> Result<(), ChainError> {
        if !ledger.charge_checkpoint(stage, delta) {
            debug!(stage, "Stage usage already charged");
        }
        self.evaluate(ledger, stage)
    }

    /// Checks the running total without charging anything.
    pub fn evaluate(&self, ledger: &UsageLedger, stage: &str) -> Result<(), ChainError> {
        let Some(ceiling) = self.ceiling else {
            return Ok(());
        };
        let used = ledger.total().total_tokens;
        if used > ceiling {
            warn!(stage, used, ceiling, "Budget exceeded");
            return Err(ChainError::BudgetExceeded {
                stage: stage.to_string(),
                used,
                ceiling,
            });
        }
        debug!(stage, used, ceiling, "Budget check passed");
        Ok(())
    }
}
