//! Tool contract types: specs advertised to the model and the calls
//! it produces in return.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for registry IDs. A tool registered under name `calculate`
/// at version `v1` gets the ID `xp_t:calculate:v1`.
pub const TOOL_ID_PREFIX: &str = "xp_t";

/// Build the canonical registry ID for a tool name + version.
pub fn tool_registry_id(name: &str, version: &str) -> String {
    format!("{TOOL_ID_PREFIX}:{name}:{version}")
}

/// Parameter types a tool property may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

/// A single named, typed parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    #[serde(rename = "type")]
    pub prop_type: PropType,
    pub description: String,
    /// Allowed values, when the property is an enumeration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<serde_json::Value>,
}

/// Tool definition exposed to the LLM.
///
/// `parameters` is an object schema with named typed properties;
/// `required` is the subset of property names the model must supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, PropertySpec>,
    #[serde(default)]
    pub required: Vec<String>,
    /// Free-form schema describing the handler's result shape.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output_structure: serde_json::Value,
}

/// A tool invocation produced by a provider adapter and consumed by
/// the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_id_format() {
        assert_eq!(tool_registry_id("calculate", "v1"), "xp_t:calculate:v1");
    }

    #[test]
    fn prop_type_serializes_lowercase() {
        let spec = PropertySpec {
            prop_type: PropType::Integer,
            description: "an int".into(),
            enum_values: vec![],
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "integer");
        assert!(json.get("enum_values").is_none());
    }
}
