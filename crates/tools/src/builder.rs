//! Fluent construction of registered tools.
//!
//! ```
//! # use chorus_tools::{ToolBuilder, ToolOutput};
//! # use chorus_domain::tool::PropType;
//! let tool = ToolBuilder::new("calculate", "v1")
//!     .description("Basic arithmetic over two operands")
//!     .prop("a", PropType::Number, "left operand", true)
//!     .prop("b", PropType::Number, "right operand", true)
//!     .enum_prop(
//!         "operation",
//!         PropType::String,
//!         "operator to apply",
//!         &["add", "sub", "mul", "div"],
//!         true,
//!     )
//!     .handler(|_cancel, args| async move {
//!         let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!         let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!         Ok(ToolOutput::data(serde_json::json!({ "result": a + b })))
//!     })
//!     .build()
//!     .unwrap();
//! assert_eq!(tool.id, "xp_t:calculate:v1");
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use chorus_domain::tool::{tool_registry_id, PropType, PropertySpec, ToolSpec};
use chorus_domain::{Error, Result};

use crate::registry::RegisteredTool;

/// What a tool handler returns on success. When `content` is set it
/// becomes the tool message verbatim; otherwise the JSON encoding of
/// `data` does.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            data: serde_json::Map::new(),
        }
    }

    /// Build from any JSON value; non-objects are wrapped under `"result"`.
    pub fn data(value: serde_json::Value) -> Self {
        let data = match value {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("result".into(), other);
                map
            }
        };
        Self {
            content: None,
            data,
        }
    }
}

/// Async tool handler: receives the cancellation token and the
/// argument map (with reserved context keys already injected).
pub type ToolHandler = Arc<
    dyn Fn(
            CancellationToken,
            serde_json::Map<String, serde_json::Value>,
        ) -> BoxFuture<'static, Result<ToolOutput>>
        + Send
        + Sync,
>;

/// Fluent builder for a [`RegisteredTool`].
pub struct ToolBuilder {
    name: String,
    version: String,
    description: String,
    parameters: BTreeMap<String, PropertySpec>,
    required: Vec<String>,
    output_structure: serde_json::Value,
    handler: Option<ToolHandler>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            parameters: BTreeMap::new(),
            required: Vec::new(),
            output_structure: serde_json::Value::Null,
            handler: None,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    /// Add a named typed property.
    pub fn prop(
        mut self,
        name: impl Into<String>,
        prop_type: PropType,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.parameters.insert(
            name.clone(),
            PropertySpec {
                prop_type,
                description: description.into(),
                enum_values: Vec::new(),
            },
        );
        if required {
            self.required.push(name);
        }
        self
    }

    /// Add a property constrained to an enumerated set of values.
    pub fn enum_prop(
        mut self,
        name: impl Into<String>,
        prop_type: PropType,
        description: impl Into<String>,
        values: &[&str],
        required: bool,
    ) -> Self {
        let name = name.into();
        self.parameters.insert(
            name.clone(),
            PropertySpec {
                prop_type,
                description: description.into(),
                enum_values: values
                    .iter()
                    .map(|v| serde_json::Value::String((*v).to_string()))
                    .collect(),
            },
        );
        if required {
            self.required.push(name);
        }
        self
    }

    pub fn output_structure(mut self, schema: serde_json::Value) -> Self {
        self.output_structure = schema;
        self
    }

    /// Attach the async handler. Mandatory.
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken, serde_json::Map<String, serde_json::Value>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |cancel, args| Box::pin(f(cancel, args))));
        self
    }

    pub fn build(self) -> Result<RegisteredTool> {
        let handler = self
            .handler
            .ok_or_else(|| Error::Validation(format!("tool {} has no handler", self.name)))?;
        Ok(RegisteredTool {
            id: tool_registry_id(&self.name, &self.version),
            version: self.version,
            spec: ToolSpec {
                name: self.name,
                description: self.description,
                parameters: self.parameters,
                required: self.required,
                output_structure: self.output_structure,
            },
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_without_handler_fails() {
        let err = ToolBuilder::new("orphan", "v1")
            .description("no handler")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn build_collects_props_and_required() {
        let tool = ToolBuilder::new("weather", "v2")
            .description("current weather")
            .prop("city", PropType::String, "city name", true)
            .prop("units", PropType::String, "metric or imperial", false)
            .handler(|_c, _a| async { Ok(ToolOutput::text("sunny")) })
            .build()
            .unwrap();

        assert_eq!(tool.id, "xp_t:weather:v2");
        assert_eq!(tool.spec.parameters.len(), 2);
        assert_eq!(tool.spec.required, vec!["city".to_string()]);
    }
}
