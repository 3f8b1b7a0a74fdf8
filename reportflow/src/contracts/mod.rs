//! Inter-stage contracts.
//!
//! This module provides:
//! - Versioned stage records passed between stages
//! - Normalization of the final report across its known shapes

mod records;
mod report;

pub use records::StageRecord;
pub use report::{normalize_report, NormalizedReport, ReportFormat, ReportSection};
