//! Normalization of the final report artifact.
//!
//! Two report shapes are in circulation: the legacy one built around a
//! `header` and an `executive_summary`, and the newer one built around a
//! `quick_reference` block and a `prose_report`. Both are read into a single
//! [`NormalizedReport`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::ChainError;

/// Which report shape the artifact used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    /// `header` + `executive_summary`.
    Legacy,
    /// `quick_reference` + `prose_report`.
    Prose,
}

/// A titled block of report text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
    /// Section heading.
    pub heading: String,
    /// Section body.
    pub body: String,
}

/// A report read from either shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedReport {
    /// Source shape.
    pub format: ReportFormat,
    /// Report title.
    pub title: Option<String>,
    /// One-paragraph summary.
    pub summary: Option<String>,
    /// Body sections in order.
    pub sections: Vec<ReportSection>,
}

#[derive(Debug, Deserialize)]
struct LegacyHeader {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacySummary {
    Text(String),
    Structured {
        #[serde(default, alias = "narrative_lead")]
        summary: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct LegacyReport {
    #[serde(default)]
    header: Option<LegacyHeader>,
    #[serde(default)]
    executive_summary: Option<LegacySummary>,
    #[serde(default)]
    sections: Vec<ReportSection>,
}

#[derive(Debug, Deserialize)]
struct QuickReference {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "one_liner")]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProseBody {
    Text(String),
    Sections(Vec<ReportSection>),
    Keyed(BTreeMap<String, String>),
}

#[derive(Debug, Deserialize)]
struct ProseReport {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    quick_reference: Option<QuickReference>,
    #[serde(default)]
    prose_report: Option<ProseBody>,
}

/// Reads a final report in either shape.
pub fn normalize_report(payload: &serde_json::Value) -> Result<NormalizedReport, ChainError> {
    let object = payload
        .as_object()
        .ok_or_else(|| ChainError::validation("report artifact must be a JSON object"))?;

    if object.contains_key("quick_reference") || object.contains_key("prose_report") {
        let report: ProseReport = serde_json::from_value(payload.clone())
            .map_err(|e| ChainError::validation(format!("prose report does not decode: {e}")))?;
        return Ok(normalize_prose(report));
    }

    if object.contains_key("header") || object.contains_key("executive_summary") {
        let report: LegacyReport = serde_json::from_value(payload.clone())
            .map_err(|e| ChainError::validation(format!("legacy report does not decode: {e}")))?;
        return Ok(normalize_legacy(report));
    }

    Err(ChainError::validation(
        "report artifact has neither quick_reference/prose_report nor header/executive_summary",
    ))
}

fn normalize_prose(report: ProseReport) -> NormalizedReport {
    let (qr_title, summary) = match report.quick_reference {
        Some(qr) => (qr.title, qr.summary),
        None => (None, None),
    };

    let sections = match report.prose_report {
        Some(ProseBody::Text(body)) => vec![ReportSection {
            heading: "Report".to_string(),
            body,
        }],
        Some(ProseBody::Sections(sections)) => sections,
        Some(ProseBody::Keyed(map)) => map
            .into_iter()
            .map(|(heading, body)| ReportSection { heading, body })
            .collect(),
        None => Vec::new(),
    };

    NormalizedReport {
        format: ReportFormat::Prose,
        title: qr_title.or(report.title),
        summary,
        sections,
    }
}

fn normalize_legacy(report: LegacyReport) -> NormalizedReport {
    let summary = match report.executive_summary {
        Some(LegacySummary::Text(text)) => Some(text),
        Some(LegacySummary::Structured { summary }) => summary,
        None => None,
    };

    NormalizedReport {
        format: ReportFormat::Legacy,
        title: report.header.and_then(|h| h.title),
        summary,
        sections: report.sections,
    }
}
