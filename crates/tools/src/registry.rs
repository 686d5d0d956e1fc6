//! In-memory tool registry, keyed by `xp_t:name:version` IDs.
//!
//! Read-heavy: the reasoning loop snapshots the spec list on every
//! round; registration is expected to happen at startup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use chorus_domain::tool::ToolSpec;
use chorus_domain::{Error, Result};

use crate::builder::ToolHandler;

/// A tool as held by the registry: spec + handler under a stable ID.
pub struct RegisteredTool {
    pub id: String,
    pub version: String,
    pub spec: ToolSpec,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("spec", &self.spec)
            .field("handler", &"<handler fn>")
            .finish()
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Rejects duplicate IDs.
    pub fn register(&self, tool: RegisteredTool) -> Result<()> {
        let mut tools = self.tools.write();
        if tools.contains_key(&tool.id) {
            return Err(Error::AlreadyExists(tool.id));
        }
        tracing::info!(tool_id = %tool.id, "tool registered");
        tools.insert(tool.id.clone(), Arc::new(tool));
        Ok(())
    }

    /// Remove a tool by ID. Idempotent.
    pub fn unregister(&self, id: &str) {
        if self.tools.write().remove(id).is_some() {
            tracing::info!(tool_id = %id, "tool unregistered");
        }
    }

    /// Specs of every registered tool, for LLM advertisement.
    pub fn contract_tools(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .read()
            .values()
            .map(|t| t.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Find a tool by its advertised name. Linear scan.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools
            .read()
            .values()
            .find(|t| t.spec.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ToolBuilder, ToolOutput};

    fn noop_tool(name: &str, version: &str) -> RegisteredTool {
        ToolBuilder::new(name, version)
            .description("noop")
            .handler(|_c, _a| async { Ok(ToolOutput::text("ok")) })
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_registration_rejected() {
        let reg = ToolRegistry::new();
        reg.register(noop_tool("echo", "v1")).unwrap();
        let err = reg.register(noop_tool("echo", "v1")).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        // A different version is a different ID.
        reg.register(noop_tool("echo", "v2")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = ToolRegistry::new();
        reg.register(noop_tool("echo", "v1")).unwrap();
        reg.unregister("xp_t:echo:v1");
        reg.unregister("xp_t:echo:v1");
        assert!(reg.is_empty());
    }

    #[test]
    fn contract_tools_sorted_by_name() {
        let reg = ToolRegistry::new();
        reg.register(noop_tool("zeta", "v1")).unwrap();
        reg.register(noop_tool("alpha", "v1")).unwrap();
        let names: Vec<_> = reg.contract_tools().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn find_by_name_hits_and_misses() {
        let reg = ToolRegistry::new();
        reg.register(noop_tool("echo", "v1")).unwrap();
        assert!(reg.find_by_name("echo").is_some());
        assert!(reg.find_by_name("ghost").is_none());
    }
}
