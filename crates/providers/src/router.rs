//! Model router: the single entry point for streaming requests.
//!
//! Adapters register under canonical `name:version` keys; a
//! [`RoutePolicy`] picks the model for each input. The router assigns
//! `handler_model` and forwards to the matching adapter's `process`.
//! The router itself never writes to the output channel beyond the
//! unknown-model error path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::config::{AdapterConfig, ProviderKind, ProvidersConfig};
use chorus_domain::stream::{DeltaBatch, ModelInput, ResponseDelta, SelectedModel};
use chorus_domain::{Error, Result};

use crate::ollama::OllamaAdapter;
use crate::openai_compat::OpenAiCompatAdapter;
use crate::traits::ModelAdapter;

/// Chooses the model for an input.
pub trait RoutePolicy: Send + Sync {
    fn select(&self, input: &ModelInput) -> SelectedModel;
}

/// Always routes to one configured model.
pub struct StaticPolicy {
    model: SelectedModel,
}

impl StaticPolicy {
    pub fn new(model: SelectedModel) -> Self {
        Self { model }
    }
}

impl RoutePolicy for StaticPolicy {
    fn select(&self, _input: &ModelInput) -> SelectedModel {
        self.model.clone()
    }
}

/// Constructed once per process and shared read-only.
pub struct ModelRouter {
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
    policy: Arc<dyn RoutePolicy>,
}

impl ModelRouter {
    /// Build adapters from the provider config.
    pub fn from_config(providers: &ProvidersConfig, adapter_cfg: &AdapterConfig) -> Result<Self> {
        let mut adapters: Vec<Arc<dyn ModelAdapter>> = Vec::new();
        for entry in &providers.entries {
            let adapter: Arc<dyn ModelAdapter> = match entry.kind {
                ProviderKind::OpenaiCompat => {
                    Arc::new(OpenAiCompatAdapter::from_entry(entry, adapter_cfg.clone())?)
                }
                ProviderKind::Ollama => {
                    Arc::new(OllamaAdapter::from_entry(entry, adapter_cfg.clone())?)
                }
            };
            adapters.push(adapter);
        }
        Ok(Self::with_adapters(
            adapters,
            Arc::new(StaticPolicy::new(providers.default_model.clone())),
        ))
    }

    /// Build from explicit adapters (useful for testing).
    pub fn with_adapters(
        adapters: Vec<Arc<dyn ModelAdapter>>,
        policy: Arc<dyn RoutePolicy>,
    ) -> Self {
        let mut map = HashMap::new();
        for adapter in adapters {
            for model in adapter.models() {
                let key = model.canonical();
                if map.insert(key.clone(), adapter.clone()).is_some() {
                    tracing::warn!(model = %key, "duplicate adapter for model; last wins");
                }
            }
        }
        Self {
            adapters: map,
            policy,
        }
    }

    pub fn known_models(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.adapters.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Assign the handler model and forward to the matching adapter.
    pub async fn stream(
        &self,
        cancel: CancellationToken,
        mut input: ModelInput,
        out: mpsc::Sender<DeltaBatch>,
    ) -> Result<()> {
        input.handler_model = self.policy.select(&input);
        let key = input.handler_model.canonical();

        let Some(adapter) = self.adapters.get(&key) else {
            let message = format!("no adapter for model {key}");
            tracing::error!(model = %key, "routing failed");
            let _ = out.try_send(vec![ResponseDelta::error(1, message.clone())]);
            return Err(Error::NotFound(message));
        };

        adapter.process(cancel, input, out).await
    }
}
