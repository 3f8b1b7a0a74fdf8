//! Schema validation and failure classification of raw stage output.

use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::error::Category;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::OnceLock;

use crate::core::ClarificationNeed;
use crate::errors::{ChainError, StructuralFault};

/// What a validator made of raw output.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedOutput {
    /// A structured record ready to checkpoint.
    Record(serde_json::Value),
    /// The stage is asking for human input.
    Clarification(ClarificationNeed),
}

/// Turns raw generated text into a validated record or a classified error.
pub trait SchemaValidator: Send + Sync + Debug {
    /// Validates raw output.
    fn validate(&self, raw: &str) -> Result<ValidatedOutput, ChainError>;
}

/// Maps a JSON parse error onto the retry taxonomy.
///
/// Running out of input means the text was cut short; a syntax error means it
/// is malformed. Both may parse on another attempt. A data error means the
/// JSON was complete but had the wrong shape, which a retry will not fix.
#[must_use]
pub fn classify_parse_error(err: &serde_json::Error) -> ChainError {
    match err.classify() {
        Category::Eof => ChainError::transient(StructuralFault::Truncated, err.to_string()),
        Category::Syntax | Category::Io => {
            ChainError::transient(StructuralFault::Malformed, err.to_string())
        }
        Category::Data => ChainError::validation(err.to_string()),
    }
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*\n?(.*?)\s*(?:```\s*)?$").ok())
        .as_ref()
}

/// Removes a surrounding markdown code fence, including an unterminated one.
#[must_use]
pub fn strip_code_fence(raw: &str) -> &str {
    if !raw.trim_start().starts_with("```") {
        return raw.trim();
    }
    match fence_pattern().and_then(|re| re.captures(raw)).and_then(|c| c.get(1)) {
        Some(body) => body.as_str(),
        None => raw.trim(),
    }
}

#[derive(Debug, Deserialize)]
struct ClarificationEnvelope {
    question: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    options: Vec<String>,
}

/// Validates JSON object output with a set of required top-level fields.
///
/// Output of the form `{"needs_clarification": true, "clarification": {...}}`
/// is read as a clarification request when the stage allows one.
#[derive(Debug, Clone, Default)]
pub struct JsonRecordValidator {
    required_fields: Vec<String>,
    allow_clarification: bool,
}

impl JsonRecordValidator {
    /// Creates a validator with no required fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the given top-level fields.
    #[must_use]
    pub fn require(mut self, fields: &[&str]) -> Self {
        self.required_fields
            .extend(fields.iter().map(|f| (*f).to_string()));
        self
    }

    /// Lets the stage ask for clarification.
    #[must_use]
    pub fn allow_clarification(mut self) -> Self {
        self.allow_clarification = true;
        self
    }

    fn parse(&self, raw: &str) -> Result<ValidatedOutput, ChainError> {
        let body = strip_code_fence(raw);
        if body.is_empty() {
            return Err(ChainError::transient(
                StructuralFault::Truncated,
                "empty output",
            ));
        }

        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| classify_parse_error(&e))?;

        let object = value
            .as_object()
            .ok_or_else(|| ChainError::validation("stage output must be a JSON object"))?;

        if object
            .get("needs_clarification")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            if !self.allow_clarification {
                return Err(ChainError::validation(
                    "stage requested clarification but does not support it",
                ));
            }
            let envelope: ClarificationEnvelope = object
                .get("clarification")
                .cloned()
                .ok_or_else(|| ChainError::validation("clarification request has no body"))
                .and_then(|v| {
                    serde_json::from_value(v).map_err(|e| {
                        ChainError::validation(format!("clarification request is malformed: {e}"))
                    })
                })?;

            let mut need = ClarificationNeed::question(envelope.question);
            need.context = envelope.context;
            if !envelope.options.is_empty() {
                need = need.with_options(envelope.options);
            }
            return Ok(ValidatedOutput::Clarification(need));
        }

        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|f| !object.contains_key(f.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ChainError::validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        Ok(ValidatedOutput::Record(value))
    }
}

impl SchemaValidator for JsonRecordValidator {
    fn validate(&self, raw: &str) -> Result<ValidatedOutput, ChainError> {
        self.parse(raw)
    }
}

/// Validates output by decoding it into `T`.
pub struct TypedValidator<T> {
    inner: JsonRecordValidator,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedValidator<T> {
    /// Creates a typed validator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: JsonRecordValidator::new(),
            _marker: PhantomData,
        }
    }

    /// Lets the stage ask for clarification.
    #[must_use]
    pub fn allow_clarification(mut self) -> Self {
        self.inner = self.inner.allow_clarification();
        self
    }
}

impl<T> Default for TypedValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for TypedValidator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedValidator")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: DeserializeOwned> SchemaValidator for TypedValidator<T> {
    fn validate(&self, raw: &str) -> Result<ValidatedOutput, ChainError> {
        match self.inner.parse(raw)? {
            ValidatedOutput::Record(value) => {
                serde_json::from_value::<T>(value.clone())
                    .map_err(|e| ChainError::validation(format!("output does not match schema: {e}")))?;
                Ok(ValidatedOutput::Record(value))
            }
            clarification => Ok(clarification),
        }
    }
}
