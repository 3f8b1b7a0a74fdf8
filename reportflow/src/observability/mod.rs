//! Observability utilities.

mod tracing;

pub use tracing::{init_tracing, LogFormat, StageTimer, DEFAULT_LOG_FILTER};
