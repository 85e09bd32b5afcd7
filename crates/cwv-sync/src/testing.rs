//! Scripted collaborators for exercising the pipeline without a network.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use cwv_core::RequestDescriptor;
use cwv_storage::{MetricsClient, RawResponse, RequestFailure};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone)]
pub enum Scripted {
    Response(RawResponse),
    Transport(String),
}

impl Scripted {
    pub fn status(status: u16, body: &str) -> Self {
        Scripted::Response(RawResponse {
            status,
            body: body.to_string(),
        })
    }

    pub fn json(value: JsonValue) -> Self {
        Self::status(200, &value.to_string())
    }

    pub fn transport(message: &str) -> Self {
        Scripted::Transport(message.to_string())
    }

    pub fn ok_empty_metrics(url: &str, form_factor: &str) -> Self {
        Self::json(json!({
            "record": {
                "key": {"url": url, "formFactor": form_factor},
                "metrics": {}
            }
        }))
    }

    /// 200 response with all four tracked metrics populated.
    pub fn ok_complete(url: &str, form_factor: &str) -> Self {
        let metric = |good: f64, p75: JsonValue| {
            json!({
                "histogram": [
                    {"start": 0, "end": 1, "density": good},
                    {"start": 1, "end": 2, "density": 0.1},
                    {"start": 2, "density": 0.05}
                ],
                "percentiles": {"p75": p75}
            })
        };
        Self::json(json!({
            "record": {
                "key": {"url": url, "formFactor": form_factor},
                "metrics": {
                    "largest_contentful_paint": metric(0.85, json!(2200)),
                    "first_input_delay": metric(0.85, json!(35)),
                    "cumulative_layout_shift": metric(0.85, json!("0.04")),
                    "first_contentful_paint": metric(0.85, json!(1400))
                }
            }
        }))
    }
}

/// Replays scripted outcomes in call order and remembers what was requested.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<RequestDescriptor>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MetricsClient for ScriptedClient {
    async fn query_record(&self, descriptor: &RequestDescriptor) -> Result<RawResponse, RequestFailure> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(descriptor.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Response(raw)) => Ok(raw),
            Some(Scripted::Transport(message)) => Err(RequestFailure::Transport(message)),
            None => Err(RequestFailure::Transport("script exhausted".to_string())),
        }
    }
}
