//! Core domain model for the Core Web Vitals export pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cwv-core";

/// Placeholder for any absent scalar in a data or audit row.
pub const SENTINEL: &str = "-";

/// Platform label used when a record carries no form factor (origin-wide data).
pub const AGGREGATED_FORM_FACTOR: &str = "AGGREGATED";

pub const DATA_COLUMN_COUNT: usize = 19;
pub const AUDIT_COLUMN_COUNT: usize = 8;

pub const DEFAULT_DATA_TAB: &str = "cruxData";
pub const AUDIT_TAB: &str = "executionHistory";

pub const DATA_HEADER: [&str; DATA_COLUMN_COUNT] = [
    "Date",
    "Platform",
    "URL",
    "LCP (Good)",
    "LCP (Needs Improvement)",
    "LCP (Poor)",
    "LCP (75th Percentile)",
    "FID (Good)",
    "FID (Needs Improvement)",
    "FID (Poor)",
    "FID (75th Percentile)",
    "CLS (Good)",
    "CLS (Needs Improvement)",
    "CLS (Poor)",
    "CLS (75th Percentile)",
    "FCP (Good)",
    "FCP (Needs Improvement)",
    "FCP (Poor)",
    "FCP (75th Percentile)",
];

pub const AUDIT_HEADER: [&str; AUDIT_COLUMN_COUNT] = [
    "Execution ID",
    "Timestamp",
    "URL",
    "Form Factor",
    "Status",
    "Response Code",
    "Error Message",
    "Normalized",
];

/// Device class dimension accepted by the metrics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormFactor {
    Phone,
    Desktop,
    AllFormFactors,
}

impl FormFactor {
    pub const ALL: [FormFactor; 3] = [
        FormFactor::Phone,
        FormFactor::Desktop,
        FormFactor::AllFormFactors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormFactor::Phone => "PHONE",
            FormFactor::Desktop => "DESKTOP",
            FormFactor::AllFormFactors => "ALL_FORM_FACTORS",
        }
    }

    /// Exact, case-sensitive token match.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ff| ff.as_str() == token)
    }
}

impl fmt::Display for FormFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned API call. Serializes to the outbound request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    pub url: String,
    pub form_factor: FormFactor,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>, form_factor: FormFactor) -> Self {
        Self {
            url: url.into(),
            form_factor,
        }
    }
}

/// Scalar cell in a tabular row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn sentinel() -> Self {
        Cell::Text(SENTINEL.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Cell::Text(s) if s == SENTINEL)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Number(n) => write!(f, "{n}"),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

/// Core Web Vitals tracked in the data tab, in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedMetric {
    LargestContentfulPaint,
    FirstInputDelay,
    CumulativeLayoutShift,
    FirstContentfulPaint,
}

impl TrackedMetric {
    pub const ALL: [TrackedMetric; 4] = [
        TrackedMetric::LargestContentfulPaint,
        TrackedMetric::FirstInputDelay,
        TrackedMetric::CumulativeLayoutShift,
        TrackedMetric::FirstContentfulPaint,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TrackedMetric::LargestContentfulPaint => "LCP",
            TrackedMetric::FirstInputDelay => "FID",
            TrackedMetric::CumulativeLayoutShift => "CLS",
            TrackedMetric::FirstContentfulPaint => "FCP",
        }
    }

    /// API metric keys in lookup order. The first key present in a response wins.
    pub fn api_keys(&self) -> &'static [&'static str] {
        match self {
            TrackedMetric::LargestContentfulPaint => &["largest_contentful_paint"],
            TrackedMetric::FirstInputDelay => &["first_input_delay", "interaction_to_next_paint"],
            TrackedMetric::CumulativeLayoutShift => &["cumulative_layout_shift"],
            TrackedMetric::FirstContentfulPaint => &["first_contentful_paint"],
        }
    }
}

/// Four cells extracted for one metric: three histogram densities and the p75.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCells {
    pub good: Cell,
    pub needs_improvement: Cell,
    pub poor: Cell,
    pub p75: Cell,
}

impl MetricCells {
    pub fn missing() -> Self {
        Self {
            good: Cell::sentinel(),
            needs_improvement: Cell::sentinel(),
            poor: Cell::sentinel(),
            p75: Cell::sentinel(),
        }
    }
}

/// Fixed-width data row. The array type pins the width to [`DATA_COLUMN_COUNT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow(pub [Cell; DATA_COLUMN_COUNT]);

impl NormalizedRow {
    pub fn from_parts(
        date: impl Into<String>,
        form_factor: impl Into<String>,
        url: impl Into<String>,
        metrics: [MetricCells; 4],
    ) -> Self {
        let [lcp, fid, cls, fcp] = metrics;
        Self([
            Cell::Text(date.into()),
            Cell::Text(form_factor.into()),
            Cell::Text(url.into()),
            lcp.good,
            lcp.needs_improvement,
            lcp.poor,
            lcp.p75,
            fid.good,
            fid.needs_improvement,
            fid.poor,
            fid.p75,
            cls.good,
            cls.needs_improvement,
            cls.poor,
            cls.p75,
            fcp.good,
            fcp.needs_improvement,
            fcp.poor,
            fcp.p75,
        ])
    }

    pub fn cells(&self) -> &[Cell] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn form_factor(&self) -> &Cell {
        &self.0[1]
    }

    pub fn url(&self) -> &Cell {
        &self.0[2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    #[default]
    Unknown,
    Success,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Unknown => "UNKNOWN",
            RequestStatus::Success => "SUCCESS",
            RequestStatus::Failed => "FAILED",
        }
    }
}

/// Per-request audit entry, one per descriptor in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub requested_at: DateTime<Utc>,
    pub url: String,
    pub form_factor: FormFactor,
    #[serde(default)]
    pub status: RequestStatus,
    pub response_code: Option<u16>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub normalized: bool,
}

impl ExecutionRecord {
    pub fn new(execution_id: &str, descriptor: &RequestDescriptor, requested_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            requested_at,
            url: descriptor.url.clone(),
            form_factor: descriptor.form_factor,
            status: RequestStatus::Unknown,
            response_code: None,
            error_message: None,
            normalized: false,
        }
    }

    pub fn matches(&self, descriptor: &RequestDescriptor) -> bool {
        self.url == descriptor.url && self.form_factor == descriptor.form_factor
    }

    /// Audit tab cells for this record, stamped with the flush timestamp.
    pub fn audit_cells(&self, flushed_at: &str) -> Vec<Cell> {
        vec![
            Cell::from(self.execution_id.as_str()),
            Cell::from(flushed_at),
            Cell::from(self.url.as_str()),
            Cell::from(self.form_factor.as_str()),
            Cell::from(self.status.as_str()),
            self.response_code
                .map(|code| Cell::from(code.to_string()))
                .unwrap_or_else(Cell::sentinel),
            self.error_message
                .as_deref()
                .map(Cell::from)
                .unwrap_or_else(Cell::sentinel),
            Cell::from(if self.normalized { "YES" } else { "NO" }),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub total_requests: usize,
    pub successful_responses: usize,
    pub rows_written: usize,
    pub failed_requests: usize,
}

impl ExecutionSummary {
    pub fn new(
        execution_id: impl Into<String>,
        total_requests: usize,
        successful_responses: usize,
        rows_written: usize,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            total_requests,
            successful_responses,
            rows_written,
            failed_requests: total_requests.saturating_sub(successful_responses),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.rows_written <= self.successful_responses
            && self.successful_responses <= self.total_requests
            && self.failed_requests + self.successful_responses == self.total_requests
    }
}

/// Batch-level failures. Per-request failures never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sequence error: {stage} stage requires {missing}")]
    Sequence {
        stage: &'static str,
        missing: &'static str,
    },
    #[error("fetch stage failed: none of {total} requests returned a usable response")]
    NoSuccessfulResponses { total: usize },
    #[error("normalize stage failed: none of {payloads} payloads could be normalized")]
    AllNormalizationFailed { payloads: usize },
    #[error("run already claimed for trigger {0}")]
    AlreadyRunning(String),
    #[error("write stage failed: {0:#}")]
    Sink(anyhow::Error),
}
