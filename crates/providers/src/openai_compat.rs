//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, vLLM, LM Studio, Together, and any other
//! endpoint following the chat-completions SSE contract. Tool-call
//! argument fragments are assembled across deltas and emitted as one
//! completed call set when the provider signals `tool_calls`.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::config::{AdapterConfig, ProviderEntry};
use chorus_domain::stream::{DeltaBatch, ModelInput, SelectedModel};
use chorus_domain::tool::ToolCall;
use chorus_domain::{Error, Result};

use crate::batch::pump_deltas;
use crate::sse::sse_event_stream;
use crate::traits::{messages_to_wire, tool_spec_to_function, ModelAdapter, ProviderEvent};

pub struct OpenAiCompatAdapter {
    id: String,
    base_url: String,
    api_key: Option<String>,
    models: Vec<SelectedModel>,
    cfg: AdapterConfig,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn from_entry(entry: &ProviderEntry, cfg: AdapterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            id: entry.id.clone(),
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            api_key: entry.api_key.clone(),
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

// ── Tool-call assembly across SSE deltas ───────────────────────────

/// Per-request assembly state: choice index → (id, name, args JSON).
#[derive(Default)]
struct CallAssembler {
    partial: BTreeMap<u64, (String, String, String)>,
}

impl CallAssembler {
    fn absorb(&mut self, tool_calls: &[serde_json::Value]) {
        for tc in tool_calls {
            let slot = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let entry = self.partial.entry(slot).or_default();
            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                entry.0 = id.to_string();
            }
            if let Some(name) = tc
                .pointer("/function/name")
                .and_then(|v| v.as_str())
            {
                entry.1 = name.to_string();
            }
            if let Some(args) = tc
                .pointer("/function/arguments")
                .and_then(|v| v.as_str())
            {
                entry.2.push_str(args);
            }
        }
    }

    /// Finish assembly, converting accumulated fragments into calls.
    /// Unparseable argument blobs degrade to an empty object.
    fn finish(&mut self) -> Vec<ToolCall> {
        let partial = std::mem::take(&mut self.partial);
        partial
            .into_values()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, args_str)| {
                let arguments = match serde_json::from_str(&args_str) {
                    Ok(serde_json::Value::Object(map)) => map,
                    _ => {
                        if !args_str.trim().is_empty() {
                            tracing::warn!(
                                tool = %name,
                                "tool call arguments are not a JSON object; using empty arguments"
                            );
                        }
                        serde_json::Map::new()
                    }
                };
                let id = if id.is_empty() {
                    uuid::Uuid::new_v4().to_string()
                } else {
                    id
                };
                ToolCall::new(id, name, arguments)
            })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

/// Parse one `data:` payload into normalized events.
fn parse_payload(assembler: &mut CallAssembler, data: &str) -> Vec<Result<ProviderEvent>> {
    if data == "[DONE]" {
        let mut events = Vec::new();
        if !assembler.is_empty() {
            // Some providers never send a tool_calls finish_reason.
            events.push(Ok(ProviderEvent::ToolCalls(assembler.finish())));
        }
        events.push(Ok(ProviderEvent::Done));
        return events;
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(Error::Provider {
                model: "openai-compat".into(),
                message: format!("bad SSE payload: {e}"),
            })]
        }
    };

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("provider error")
            .to_string();
        return vec![Err(Error::Provider {
            model: "openai-compat".into(),
            message,
        })];
    }

    let Some(choice) = value.pointer("/choices/0") else {
        return Vec::new();
    };

    let mut events = Vec::new();

    if let Some(tool_calls) = choice
        .pointer("/delta/tool_calls")
        .and_then(|v| v.as_array())
    {
        assembler.absorb(tool_calls);
    }
    if let Some(text) = choice.pointer("/delta/content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(ProviderEvent::Text(text.to_string())));
        }
    }

    match choice.get("finish_reason").and_then(|v| v.as_str()) {
        Some("tool_calls") => {
            events.push(Ok(ProviderEvent::ToolCalls(assembler.finish())));
        }
        Some(_) => {
            if !assembler.is_empty() {
                events.push(Ok(ProviderEvent::ToolCalls(assembler.finish())));
            }
            events.push(Ok(ProviderEvent::Done));
        }
        None => {}
    }

    events
}

#[async_trait::async_trait]
impl ModelAdapter for OpenAiCompatAdapter {
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
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.build_body(&input));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let model = input.handler_model.clone();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            resp = req.send() => resp.map_err(|e| Error::Http(e.to_string()))?,
        };
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // Deliver the failure in-stream, per the adapter contract.
            let events: crate::traits::BoxStream<'static, Result<ProviderEvent>> =
                Box::pin(futures_util::stream::once(async move {
                    Err(Error::Provider {
                        model: model.canonical(),
                        message: format!("HTTP {status}: {}", truncate(&body, 200)),
                    })
                }));
            return pump_deltas(cancel, &self.cfg, &input.handler_model, events, out).await;
        }

        let mut assembler = CallAssembler::default();
        let events = sse_event_stream(response, move |data| parse_payload(&mut assembler, data));

        tracing::debug!(adapter = %self.id, model = %input.handler_model, "stream opened");
        pump_deltas(cancel, &self.cfg, &input.handler_model, events, out).await
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_delta() {
        let mut asm = CallAssembler::default();
        let events = parse_payload(
            &mut asm,
            r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ProviderEvent::Text(t) if t == "Hel"
        ));
    }

    #[test]
    fn assembles_streamed_tool_call_fragments() {
        let mut asm = CallAssembler::default();
        parse_payload(
            &mut asm,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"calculate","arguments":"{\"a\":"}}]},"finish_reason":null}]}"#,
        );
        parse_payload(
            &mut asm,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"2,\"b\":3}"}}]},"finish_reason":null}]}"#,
        );
        let events = parse_payload(
            &mut asm,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        );

        assert_eq!(events.len(), 1);
        let ProviderEvent::ToolCalls(calls) = events[0].as_ref().unwrap() else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].tool_name, "calculate");
        assert_eq!(calls[0].arguments["a"], 2);
        assert_eq!(calls[0].arguments["b"], 3);
    }

    #[test]
    fn done_sentinel_emits_done() {
        let mut asm = CallAssembler::default();
        let events = parse_payload(&mut asm, "[DONE]");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].as_ref().unwrap(), ProviderEvent::Done));
    }

    #[test]
    fn provider_error_payload_becomes_stream_error() {
        let mut asm = CallAssembler::default();
        let events = parse_payload(&mut asm, r#"{"error":{"message":"model overloaded"}}"#);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }

    #[test]
    fn stop_finish_reason_emits_done() {
        let mut asm = CallAssembler::default();
        let events = parse_payload(
            &mut asm,
            r#"{"choices":[{"delta":{"content":"."},"finish_reason":"stop"}]}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].as_ref().unwrap(), ProviderEvent::Done));
    }

    #[test]
    fn bad_arguments_degrade_to_empty_object() {
        let mut asm = CallAssembler::default();
        parse_payload(
            &mut asm,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"t","arguments":"not json"}}]},"finish_reason":null}]}"#,
        );
        let events = parse_payload(
            &mut asm,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        );
        let ProviderEvent::ToolCalls(calls) = events[0].as_ref().unwrap() else {
            panic!("expected tool calls");
        };
        assert!(calls[0].arguments.is_empty());
    }
}
