//! Normalize stage: payloads to data rows, reconciled with the audit records.

use cwv_core::{ExecutionRecord, NormalizedRow, PipelineError, RequestStatus};
use cwv_normalize::normalize_payload;
use tracing::{debug, warn};

use crate::fetch::FetchedPayload;

/// One row per structurally usable payload, all stamped with the same `date`.
///
/// For each produced row the first still-unnormalized SUCCESS record for the
/// payload's request is marked normalized.
pub fn normalize_all(
    payloads: &[FetchedPayload],
    records: &mut [ExecutionRecord],
    date: &str,
) -> Result<Vec<NormalizedRow>, PipelineError> {
    let mut rows = Vec::with_capacity(payloads.len());

    for fetched in payloads {
        match normalize_payload(&fetched.payload, date) {
            Ok(row) => {
                rows.push(row);
                match records.iter_mut().find(|r| {
                    r.status == RequestStatus::Success && !r.normalized && r.matches(&fetched.descriptor)
                }) {
                    Some(record) => record.normalized = true,
                    None => debug!(url = %fetched.descriptor.url, "no audit record to mark normalized"),
                }
            }
            Err(err) => warn!(
                url = %fetched.descriptor.url,
                form_factor = %fetched.descriptor.form_factor,
                error = %err,
                "skipping payload"
            ),
        }
    }

    if rows.is_empty() && !payloads.is_empty() {
        return Err(PipelineError::AllNormalizationFailed {
            payloads: payloads.len(),
        });
    }
    Ok(rows)
}
