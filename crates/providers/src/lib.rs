//! Provider adapters and the model router.
//!
//! Each adapter translates one provider's native streaming wire format
//! into the shared delta contract: monotonic indices, bounded batches,
//! a terminal done marker, and a channel the adapter alone closes.

pub mod batch;
pub mod ollama;
pub mod openai_compat;
pub mod router;
pub mod sse;
pub mod traits;

pub use batch::DeltaBatcher;
pub use ollama::OllamaAdapter;
pub use openai_compat::OpenAiCompatAdapter;
pub use router::{ModelRouter, RoutePolicy, StaticPolicy};
pub use traits::{ModelAdapter, ProviderEvent};
