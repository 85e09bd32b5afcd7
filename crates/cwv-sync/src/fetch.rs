//! Sequential fetch stage.

use std::time::Duration;

use cwv_core::{ExecutionRecord, PipelineError, RequestDescriptor, RequestStatus};
use cwv_normalize::ZonedClock;
use cwv_storage::{classify_response, MetricsClient};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

/// Parsed 200 response together with the request that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPayload {
    pub descriptor: RequestDescriptor,
    pub payload: JsonValue,
}

/// Issue one request per descriptor, in order, pausing `delay` between requests.
///
/// Every descriptor gets an [`ExecutionRecord`] appended to `records`, whatever
/// the outcome. Only a batch with zero usable responses is an error.
pub async fn fetch_all(
    client: &dyn MetricsClient,
    execution_id: &str,
    descriptors: &[RequestDescriptor],
    delay: Duration,
    clock: &ZonedClock,
    records: &mut Vec<ExecutionRecord>,
) -> Result<Vec<FetchedPayload>, PipelineError> {
    let mut payloads = Vec::new();

    for (idx, descriptor) in descriptors.iter().enumerate() {
        let mut record = ExecutionRecord::new(execution_id, descriptor, clock.now_utc());

        let outcome = match client.query_record(descriptor).await {
            Ok(raw) => {
                record.response_code = Some(raw.status);
                classify_response(raw)
            }
            Err(failure) => Err(failure),
        };

        match outcome {
            Ok(payload) => {
                record.status = RequestStatus::Success;
                payloads.push(FetchedPayload {
                    descriptor: descriptor.clone(),
                    payload,
                });
                info!(url = %descriptor.url, form_factor = %descriptor.form_factor, "fetched record");
            }
            Err(failure) => {
                warn!(
                    url = %descriptor.url,
                    form_factor = %descriptor.form_factor,
                    error = %failure,
                    "request failed"
                );
                record.status = RequestStatus::Failed;
                record.response_code = failure.response_code();
                record.error_message = Some(failure.to_string());
            }
        }
        records.push(record);

        if idx + 1 < descriptors.len() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    if payloads.is_empty() {
        return Err(PipelineError::NoSuccessfulResponses {
            total: descriptors.len(),
        });
    }
    Ok(payloads)
}
