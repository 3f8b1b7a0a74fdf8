//! Collaborator interfaces for the generative service and output validation.
//!
//! The orchestrator never inspects the service's internals: it sizes the
//! output ceiling, applies the request timeout, and classifies failures so the
//! retry wrapper can decide what to do.

mod service;
mod validator;

pub use service::{GenerationRequest, GenerationResponse, GenerativeService};
pub use validator::{
    classify_parse_error, strip_code_fence, JsonRecordValidator, SchemaValidator, TypedValidator,
    ValidatedOutput,
};
