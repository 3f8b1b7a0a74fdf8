//! Chain variants: fixed, ordered stage sequences known at build time.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::errors::{ChainError, ChainValidationError};
use crate::stages::Stage;

/// A validated chain variant.
#[derive(Clone)]
pub struct ChainDefinition {
    variant: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl ChainDefinition {
    /// Variant identifier.
    #[must_use]
    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// Stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Stage at `index`.
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&Arc<dyn Stage>> {
        self.stages.get(index)
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a built chain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Debug for ChainDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDefinition")
            .field("variant", &self.variant)
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Builder for creating validated chain variants.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    variant: String,
    stages: Vec<Arc<dyn Stage>>,
    names: HashSet<String>,
}

impl ChainBuilder {
    /// Creates a builder for a variant.
    #[must_use]
    pub fn new(variant: impl Into<String>) -> Self {
        Self {
            variant: variant.into(),
            stages: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage name is empty or already used.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Result<Self, ChainValidationError> {
        let name = stage.name().to_string();
        if name.trim().is_empty() {
            return Err(ChainValidationError::new(
                "CHAIN-STAGE-NAME",
                format!("Chain '{}' has a stage with an empty name", self.variant),
            )
            .with_fix_hint("Give every stage a unique, non-empty name."));
        }
        if !self.names.insert(name.clone()) {
            return Err(ChainValidationError::new(
                "CHAIN-DUPLICATE-STAGE",
                format!("Stage '{name}' appears twice in chain '{}'", self.variant),
            )
            .with_fix_hint("Checkpoints are keyed by stage name; rename one of the stages."));
        }
        self.stages.push(stage);
        Ok(self)
    }

    /// Builds the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the variant name is empty or no stage was added.
    pub fn build(self) -> Result<ChainDefinition, ChainValidationError> {
        if self.variant.trim().is_empty() {
            return Err(ChainValidationError::new("CHAIN-VARIANT-NAME", "Chain variant name is empty")
                .with_fix_hint("Pass the variant identifier used by trigger events."));
        }
        if self.stages.is_empty() {
            return Err(ChainValidationError::new(
                "CHAIN-EMPTY",
                format!("Chain '{}' has no stages", self.variant),
            )
            .with_fix_hint("Add at least one stage before building."));
        }
        Ok(ChainDefinition {
            variant: self.variant,
            stages: self.stages,
        })
    }

    /// Number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

/// Registered chain variants by identifier.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    chains: RwLock<HashMap<String, Arc<ChainDefinition>>>,
}

impl ChainRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a chain variant.
    ///
    /// # Errors
    ///
    /// Returns an error if the variant is already registered.
    pub fn register(&self, chain: ChainDefinition) -> Result<(), ChainValidationError> {
        let mut chains = self.chains.write();
        if chains.contains_key(chain.variant()) {
            return Err(ChainValidationError::new(
                "CHAIN-DUPLICATE-VARIANT",
                format!("Chain variant '{}' is already registered", chain.variant()),
            ));
        }
        chains.insert(chain.variant().to_string(), Arc::new(chain));
        Ok(())
    }

    /// Looks up a chain variant.
    pub fn get(&self, variant: &str) -> Result<Arc<ChainDefinition>, ChainError> {
        self.chains
            .read()
            .get(variant)
            .cloned()
            .ok_or_else(|| ChainError::UnknownChain(variant.to_string()))
    }

    /// Registered variant identifiers, sorted.
    #[must_use]
    pub fn variants(&self) -> Vec<String> {
        let mut variants: Vec<String> = self.chains.read().keys().cloned().collect();
        variants.sort();
        variants
    }
}
