//! Ollama native adapter.
//!
//! Streams NDJSON from `/api/chat`. Unlike the OpenAI wire format,
//! Ollama delivers tool calls whole (arguments as a JSON object, no
//! call id), so the adapter synthesizes ids.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::config::{AdapterConfig, ProviderEntry};
use chorus_domain::stream::{DeltaBatch, ModelInput, SelectedModel};
use chorus_domain::tool::ToolCall;
use chorus_domain::{Error, Result};

use crate::batch::pump_deltas;
use crate::traits::{messages_to_wire, tool_spec_to_function, BoxStream, ModelAdapter, ProviderEvent};

pub struct OllamaAdapter {
    id: String,
    base_url: String,
    models: Vec<SelectedModel>,
    cfg: AdapterConfig,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn from_entry(entry: &ProviderEntry, cfg: AdapterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            id: entry.id.clone(),
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            models: entry.models.clone(),
            cfg,
            client,
        })
    }

    fn build_body(&self, input: &ModelInput) -> serde_json::Value {
        let tools: Vec<serde_json::Value> =
            input.tools.iter().map(tool_spec_to_function).collect();
        let mut body = serde_json::json!({
            "model": input.handler_model.name,
            "messages": messages_to_wire(input),
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools);
        }
        body
    }
}

/// Extract complete lines from an NDJSON buffer, leaving any partial
/// trailing line in place.
fn drain_ndjson_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Parse one NDJSON line into normalized events.
fn parse_line(data: &str) -> Vec<Result<ProviderEvent>> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(Error::Provider {
                model: "ollama".into(),
                message: format!("bad NDJSON line: {e}"),
            })]
        }
    };

    if let Some(err) = value.get("error").and_then(|v| v.as_str()) {
        return vec![Err(Error::Provider {
            model: "ollama".into(),
            message: err.to_string(),
        })];
    }

    let mut events = Vec::new();

    if let Some(tool_calls) = value
        .pointer("/message/tool_calls")
        .and_then(|v| v.as_array())
    {
        let calls: Vec<ToolCall> = tool_calls
            .iter()
            .filter_map(|tc| {
                let name = tc.pointer("/function/name")?.as_str()?.to_string();
                let arguments = match tc.pointer("/function/arguments") {
                    Some(serde_json::Value::Object(map)) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                Some(ToolCall::new(
                    uuid::Uuid::new_v4().to_string(),
                    name,
                    arguments,
                ))
            })
            .collect();
        if !calls.is_empty() {
            events.push(Ok(ProviderEvent::ToolCalls(calls)));
        }
    }

    if let Some(text) = value.pointer("/message/content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(ProviderEvent::Text(text.to_string())));
        }
    }

    if value.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
        events.push(Ok(ProviderEvent::Done));
    }

    events
}

/// Build a normalized event stream from an NDJSON response body.
fn ndjson_event_stream(response: reqwest::Response) -> BoxStream<'static, Result<ProviderEvent>> {
    let stream = async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        let mut done_emitted = false;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for line in drain_ndjson_lines(&mut buffer) {
                        for event in parse_line(&line) {
                            if matches!(&event, Ok(ProviderEvent::Done)) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Err(e) => {
                    yield Err(Error::Http(e.to_string()));
                    return;
                }
            }
        }

        if !buffer.trim().is_empty() {
            for event in parse_line(buffer.trim()) {
                if matches!(&event, Ok(ProviderEvent::Done)) {
                    done_emitted = true;
                }
                yield event;
            }
        }

        if !done_emitted {
            yield Ok(ProviderEvent::Done);
        }
    };

    Box::pin(stream)
}

#[async_trait::async_trait]
impl ModelAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn models(&self) -> Vec<SelectedModel> {
        self.models.clone()
    }

    async fn process(
        &self,
        cancel: CancellationToken,
        input: ModelInput,
        out: mpsc::Sender<DeltaBatch>,
    ) -> Result<()> {
        let url = format!("{}/api/chat", self.base_url);
        let req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.build_body(&input));

        let model = input.handler_model.clone();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            resp = req.send() => resp.map_err(|e| Error::Http(e.to_string()))?,
        };
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let events: BoxStream<'static, Result<ProviderEvent>> =
                Box::pin(futures_util::stream::once(async move {
                    Err(Error::Provider {
                        model: model.canonical(),
                        message: format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
                    })
                }));
            return pump_deltas(cancel, &self.cfg, &input.handler_model, events, out).await;
        }

        let events = ndjson_event_stream(response);
        tracing::debug!(adapter = %self.id, model = %input.handler_model, "stream opened");
        pump_deltas(cancel, &self.cfg, &input.handler_model, events, out).await
    }
}
