//! Defensive extraction of Core Web Vitals records into fixed-width rows.
//!
//! Every optional hop of a record (metric object, histogram, bucket, density,
//! percentile) is read through one accessor chain and independently falls
//! back to the `"-"` sentinel, so a partially populated response still yields
//! a full row.

use cwv_core::{Cell, MetricCells, NormalizedRow, TrackedMetric, AGGREGATED_FORM_FACTOR, SENTINEL};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub mod clock;

pub use clock::{Clock, FixedClock, SystemClock, ZonedClock};

pub const CRATE_NAME: &str = "cwv-normalize";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("payload has no record object")]
    MissingRecord,
    #[error("record has no key object")]
    MissingKey,
    #[error("record has no metrics object")]
    MissingMetrics,
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

fn json_object<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    json_path(value, path).filter(|v| v.is_object())
}

/// Numbers stay numeric, strings stay text (CLS p75 arrives as `"0.05"`).
fn scalar_cell(value: Option<&JsonValue>) -> Cell {
    match value {
        Some(JsonValue::Number(n)) => n.as_f64().map(Cell::Number).unwrap_or_else(Cell::sentinel),
        Some(JsonValue::String(s)) => Cell::Text(s.clone()),
        _ => Cell::sentinel(),
    }
}

/// Good / needs-improvement / poor densities and p75 for one metric.
pub fn extract_metric(metrics: &JsonValue, metric: TrackedMetric) -> MetricCells {
    let keys = metric.api_keys();
    let Some((idx, entry)) = keys
        .iter()
        .enumerate()
        .find_map(|(idx, key)| json_object(metrics, &[*key]).map(|entry| (idx, entry)))
    else {
        debug!(metric = metric.label(), "metric absent from record");
        return MetricCells::missing();
    };
    if idx > 0 {
        debug!(metric = metric.label(), key = keys[idx], "using fallback metric key");
    }

    let histogram = entry.get("histogram").and_then(JsonValue::as_array);
    let density = |idx: usize| {
        scalar_cell(
            histogram
                .and_then(|buckets| buckets.get(idx))
                .and_then(|bucket| bucket.get("density")),
        )
    };

    MetricCells {
        good: density(0),
        needs_improvement: density(1),
        poor: density(2),
        p75: scalar_cell(json_path(entry, &["percentiles", "p75"])),
    }
}

/// Map one API payload to a data row dated `date`.
pub fn normalize_payload(payload: &JsonValue, date: &str) -> Result<NormalizedRow, NormalizeError> {
    let record = json_object(payload, &["record"]).ok_or(NormalizeError::MissingRecord)?;
    let key = json_object(record, &["key"]).ok_or(NormalizeError::MissingKey)?;
    let metrics = json_object(record, &["metrics"]).ok_or(NormalizeError::MissingMetrics)?;

    let form_factor = json_str(key, &["formFactor"]).unwrap_or(AGGREGATED_FORM_FACTOR);
    let url = json_str(key, &["url"])
        .or_else(|| json_str(key, &["origin"]))
        .unwrap_or(SENTINEL);

    let metric_cells = TrackedMetric::ALL.map(|metric| extract_metric(metrics, metric));
    Ok(NormalizedRow::from_parts(date, form_factor, url, metric_cells))
}
