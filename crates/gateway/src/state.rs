//! Shared application state passed to all handlers.

use std::sync::Arc;

use chorus_domain::config::Config;
use chorus_domain::Result;
use chorus_providers::ModelRouter;
use chorus_registry::{DeviceRegistry, Publisher};
use chorus_tools::ToolRegistry;
use chorus_voice::stt::{SpeechToText, SttClient};
use chorus_voice::tts::{SpeechSynthesizer, TtsClient};
use chorus_voice::vad::VadClient;

use crate::session::SessionMap;
use crate::tools::register_builtin_tools;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<DeviceRegistry>,
    pub publisher: Publisher,
    pub router: Arc<ModelRouter>,
    pub tools: Arc<ToolRegistry>,
    pub stt: Arc<dyn SpeechToText>,
    pub vad: Option<Arc<VadClient>>,
    pub tts: Arc<dyn SpeechSynthesizer>,
    pub sessions: Arc<SessionMap>,
}

impl AppState {
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let registry = Arc::new(DeviceRegistry::new());
        let publisher = Publisher::new(registry.clone());

        let router = Arc::new(ModelRouter::from_config(
            &config.providers,
            &config.adapter,
        )?);

        let tools = Arc::new(ToolRegistry::new());
        register_builtin_tools(&tools)?;

        let stt: Arc<dyn SpeechToText> = Arc::new(SttClient::from_config(&config.voice)?);
        let vad = VadClient::from_config(&config.voice)?.map(Arc::new);
        let tts: Arc<dyn SpeechSynthesizer> = Arc::new(TtsClient::from_config(&config.voice)?);

        Ok(Self {
            config,
            registry,
            publisher,
            router,
            tools,
            stt,
            vad,
            tts,
            sessions: Arc::new(SessionMap::new()),
        })
    }
}
