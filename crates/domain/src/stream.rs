//! Streaming delta contract between provider adapters and the
//! reasoning loop.
//!
//! Adapters translate provider-native streams into [`ResponseDelta`]s,
//! batch them, and emit [`DeltaBatch`]es on an mpsc channel that the
//! adapter alone closes (by dropping its sender).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::ChatMessage;
use crate::tool::{ToolCall, ToolSpec};

/// Canonical model descriptor. Routing is keyed by `name + version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectedModel {
    pub name: String,
    pub version: String,
}

impl SelectedModel {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// The routing key: `name:version`.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

impl std::fmt::Display for SelectedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// One streaming request handed to the router.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub id: Uuid,
    pub msgs: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub handler_model: SelectedModel,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl ModelInput {
    pub fn new(msgs: Vec<ChatMessage>, tools: Vec<ToolSpec>, model: SelectedModel) -> Self {
        Self {
            id: Uuid::new_v4(),
            msgs,
            tools,
            handler_model: model,
            meta: serde_json::Map::new(),
        }
    }
}

/// A streaming increment from a provider: text, tool calls, an error,
/// or the terminal done marker.
///
/// `index` is monotonic per request, assigned by the adapter starting
/// at 1. Batches preserve intra-batch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub index: u64,
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

/// A non-empty ordered slice of deltas, the unit of channel delivery.
pub type DeltaBatch = Vec<ResponseDelta>;

impl ResponseDelta {
    pub fn text(index: u64, text: impl Into<String>) -> Self {
        Self {
            msg: Some(text.into()),
            tool_calls: Vec::new(),
            error: None,
            index,
            done: false,
            created_at: Utc::now(),
        }
    }

    pub fn tool_calls(index: u64, calls: Vec<ToolCall>) -> Self {
        Self {
            msg: None,
            tool_calls: calls,
            error: None,
            index,
            done: false,
            created_at: Utc::now(),
        }
    }

    pub fn error(index: u64, message: impl Into<String>) -> Self {
        Self {
            msg: None,
            tool_calls: Vec::new(),
            error: Some(message.into()),
            index,
            done: false,
            created_at: Utc::now(),
        }
    }

    pub fn done(index: u64) -> Self {
        Self {
            msg: None,
            tool_calls: Vec::new(),
            error: None,
            index,
            done: true,
            created_at: Utc::now(),
        }
    }
}
