//! Built-in tools registered at startup.

use chorus_domain::tool::PropType;
use chorus_domain::Result;
use chorus_tools::{ToolBuilder, ToolOutput, ToolRegistry};

/// Register the default toolset.
pub fn register_builtin_tools(registry: &ToolRegistry) -> Result<()> {
    registry.register(
        ToolBuilder::new("calculate", "v1")
            .description("Perform basic arithmetic on two numeric operands.")
            .prop("a", PropType::Number, "left operand", true)
            .prop("b", PropType::Number, "right operand", true)
            .enum_prop(
                "operation",
                PropType::String,
                "operator to apply",
                &["add", "sub", "mul", "div"],
                true,
            )
            .output_structure(serde_json::json!({ "result": "number" }))
            .handler(|_cancel, args| async move {
                let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let result = match args.get("operation").and_then(|v| v.as_str()) {
                    Some("sub") => a - b,
                    Some("mul") => a * b,
                    Some("div") => {
                        if b == 0.0 {
                            return Err(chorus_domain::Error::Validation(
                                "division by zero".into(),
                            ));
                        }
                        a / b
                    }
                    _ => a + b,
                };
                // Integral results read better in answers.
                let value = if result.fract() == 0.0 {
                    serde_json::json!(result as i64)
                } else {
                    serde_json::json!(result)
                };
                Ok(ToolOutput::data(serde_json::json!({ "result": value })))
            })
            .build()?,
    )?;

    registry.register(
        ToolBuilder::new("current_time", "v1")
            .description("Report the current date and time for the session owner.")
            .handler(|_cancel, args| async move {
                // The executor injects the timestamp; echo it back.
                let now = args
                    .get("__current_date_time")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(ToolOutput::text(now))
            })
            .build()?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_domain::tool::ToolCall;
    use chorus_tools::{ToolExecutor, UserContext};
    use tokio_util::sync::CancellationToken;

    fn executor() -> ToolExecutor {
        let mut ex = ToolExecutor::new();
        ex.set_user_context(UserContext {
            user_id: "u1".into(),
            username: "ada".into(),
            email: "ada@example.com".into(),
        });
        ex
    }

    #[tokio::test]
    async fn calculate_adds() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry).unwrap();

        let mut args = serde_json::Map::new();
        args.insert("a".into(), 2.into());
        args.insert("b".into(), 3.into());
        args.insert("operation".into(), "add".into());

        let outcome = executor()
            .execute(
                CancellationToken::new(),
                &registry,
                ToolCall::new("c1", "calculate", args),
            )
            .await
            .unwrap();
        assert_eq!(outcome.message_text(), r#"{"result":5}"#);
    }

    #[tokio::test]
    async fn calculate_rejects_division_by_zero() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry).unwrap();

        let mut args = serde_json::Map::new();
        args.insert("a".into(), 1.into());
        args.insert("b".into(), 0.into());
        args.insert("operation".into(), "div".into());

        let outcome = executor()
            .execute(
                CancellationToken::new(),
                &registry,
                ToolCall::new("c1", "calculate", args),
            )
            .await
            .unwrap();
        assert!(outcome.is_error());
    }

    #[tokio::test]
    async fn current_time_reports_injected_timestamp() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry).unwrap();

        let outcome = executor()
            .execute(
                CancellationToken::new(),
                &registry,
                ToolCall::new("c1", "current_time", serde_json::Map::new()),
            )
            .await
            .unwrap();
        chrono::DateTime::parse_from_rfc3339(&outcome.message_text()).unwrap();
    }
}
