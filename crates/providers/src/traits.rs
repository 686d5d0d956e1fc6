use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::stream::{DeltaBatch, ModelInput, SelectedModel};
use chorus_domain::tool::{ToolCall, ToolSpec};
use chorus_domain::Result;

/// A boxed async stream of provider-native events.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Normalized event decoded from a provider's wire format, before
/// batching. Every adapter reduces its native stream to these.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A text token chunk.
    Text(String),
    /// One or more completed tool invocations.
    ToolCalls(Vec<ToolCall>),
    /// The provider finished this turn.
    Done,
}

/// Trait every provider adapter implements.
///
/// `process` issues the streaming call, translates native deltas into
/// [`chorus_domain::stream::ResponseDelta`] batches, and emits them on
/// `out`. The adapter owns `out`: it is closed exactly once, by
/// dropping the sender when `process` returns. Errors are delivered
/// in-stream as `{error}` deltas before the close.
#[async_trait::async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Unique adapter instance id (for logs).
    fn id(&self) -> &str;

    /// Canonical models this adapter serves.
    fn models(&self) -> Vec<SelectedModel>;

    async fn process(
        &self,
        cancel: CancellationToken,
        input: ModelInput,
        out: mpsc::Sender<DeltaBatch>,
    ) -> Result<()>;
}

// ── Shared request building ────────────────────────────────────────

/// Render a tool spec as the JSON-schema function format shared by
/// the OpenAI-compatible and Ollama chat APIs.
pub(crate) fn tool_spec_to_function(spec: &ToolSpec) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for (name, prop) in &spec.parameters {
        let mut schema = serde_json::Map::new();
        schema.insert(
            "type".into(),
            serde_json::to_value(prop.prop_type).unwrap_or(serde_json::Value::Null),
        );
        schema.insert("description".into(), prop.description.clone().into());
        if !prop.enum_values.is_empty() {
            schema.insert("enum".into(), prop.enum_values.clone().into());
        }
        properties.insert(name.clone(), serde_json::Value::Object(schema));
    }

    serde_json::json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": spec.required,
            },
        },
    })
}

/// Render the conversation as wire messages (`role` + `content`).
pub(crate) fn messages_to_wire(input: &ModelInput) -> Vec<serde_json::Value> {
    input
        .msgs
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": serde_json::to_value(m.role).unwrap_or_else(|_| "user".into()),
                "content": m.content,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_domain::message::ChatMessage;
    use chorus_domain::tool::{PropType, PropertySpec};
    use std::collections::BTreeMap;

    #[test]
    fn tool_spec_renders_function_schema() {
        let mut params = BTreeMap::new();
        params.insert(
            "operation".to_string(),
            PropertySpec {
                prop_type: PropType::String,
                description: "operator".into(),
                enum_values: vec!["add".into(), "sub".into()],
            },
        );
        let spec = ToolSpec {
            name: "calculate".into(),
            description: "arithmetic".into(),
            parameters: params,
            required: vec!["operation".into()],
            output_structure: serde_json::Value::Null,
        };

        let f = tool_spec_to_function(&spec);
        assert_eq!(f["function"]["name"], "calculate");
        assert_eq!(f["function"]["parameters"]["type"], "object");
        assert_eq!(
            f["function"]["parameters"]["properties"]["operation"]["enum"][0],
            "add"
        );
        assert_eq!(f["function"]["parameters"]["required"][0], "operation");
    }

    #[test]
    fn wire_messages_carry_lowercase_roles() {
        let input = ModelInput::new(
            vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            vec![],
            SelectedModel::new("m", "v"),
        );
        let wire = messages_to_wire(&input);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"], "hi");
    }
}
