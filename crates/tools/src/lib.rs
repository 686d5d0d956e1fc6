//! Tool system: fluent builder, in-memory registry, and the executor
//! that injects the per-session user context into every call.

pub mod builder;
pub mod executor;
pub mod registry;

pub use builder::{ToolBuilder, ToolOutput};
pub use executor::{ToolExecutor, ToolOutcome, UserContext};
pub use registry::{RegisteredTool, ToolRegistry};
