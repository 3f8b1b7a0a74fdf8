//! Versioned, typed inter-stage records.
//!
//! Every stage output is stored as a [`StageRecord`] tagged with the stage
//! name and the schema version it was produced under. Downstream stages
//! decode it into their own typed view with [`StageRecord::decode_versioned`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::ChainError;

/// A validated stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage that produced the record.
    pub stage: String,
    /// Schema version of `payload`.
    pub schema_version: u32,
    /// The validated structured output.
    pub payload: serde_json::Value,
}

impl StageRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(stage: impl Into<String>, schema_version: u32, payload: serde_json::Value) -> Self {
        Self {
            stage: stage.into(),
            schema_version,
            payload,
        }
    }

    /// Creates a record from a typed payload.
    pub fn from_typed<T: Serialize>(
        stage: impl Into<String>,
        schema_version: u32,
        payload: &T,
    ) -> Result<Self, ChainError> {
        Ok(Self::new(stage, schema_version, serde_json::to_value(payload)?))
    }

    /// Decodes the payload regardless of version.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChainError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ChainError::validation(format!(
                "record from stage '{}' (v{}) does not decode: {e}",
                self.stage, self.schema_version
            ))
        })
    }

    /// Decodes the payload if its version is one the caller understands.
    pub fn decode_versioned<T: DeserializeOwned>(&self, accepted: &[u32]) -> Result<T, ChainError> {
        if !accepted.contains(&self.schema_version) {
            return Err(ChainError::validation(format!(
                "record from stage '{}' has schema v{}, expected one of {:?}",
                self.stage, self.schema_version, accepted
            )));
        }
        self.decode()
    }

    /// Reads a top-level field of the payload.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }
}
