//! Per-connection session lifecycle.
//!
//! A session owns its device registration, its tool executor context,
//! and (for audio-capable connections) a voice stream plus the bridge
//! task that turns voice interrupts into reasoning invocations. The
//! bridge passes channels around, never references: the voice stream
//! knows nothing about the reasoning loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::audio::AudioInput;
use chorus_domain::message::ChatMessage;
use chorus_pipeline::OutputPipeline;
use chorus_reasoning::ReasoningLoop;
use chorus_registry::{Capabilities, Device, Publisher};
use chorus_tools::{ToolExecutor, UserContext};
use chorus_voice::vss::{ListenMode, VoiceStream, VssEvent, VssOutput};

use crate::state::AppState;
use crate::ws::{OutboundFrame, WsEndpoint};

/// Persona prepended to every exchange.
const SYSTEM_PROMPT: &str = "You are Chorus, a concise voice-first assistant. \
Prefer short spoken-style sentences. Use the available tools when they help.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session map & sweeper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionHandle {
    pub user_id: String,
    pub device_id: String,
    pub cancel: CancellationToken,
}

/// Live sessions keyed by session id.
#[derive(Default)]
pub struct SessionMap {
    inner: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: String, handle: SessionHandle) {
        self.inner.lock().insert(session_id, handle);
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.lock().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Cancel the session owning the given device. Returns whether a
    /// session was found.
    pub fn cancel_for_device(&self, user_id: &str, device_id: &str) -> bool {
        let inner = self.inner.lock();
        for handle in inner.values() {
            if handle.user_id == user_id && handle.device_id == device_id {
                handle.cancel.cancel();
                return true;
            }
        }
        false
    }
}

/// Periodically close sessions whose devices went idle.
pub fn spawn_idle_sweeper(state: AppState, cancel: CancellationToken) {
    let sweep = Duration::from_secs(state.config.sessions.sweep_interval_mins * 60);
    let idle = chrono::Duration::minutes(state.config.sessions.idle_timeout_mins as i64);

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep.max(Duration::from_secs(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            for (user_id, device_id) in state.registry.idle_devices(idle) {
                tracing::info!(user_id = %user_id, device_id = %device_id, "closing idle session");
                if !state.sessions.cancel_for_device(&user_id, &device_id) {
                    // Orphaned device with no live session.
                    let _ = state.registry.remove_device(&user_id, &device_id);
                }
            }
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Session {
    pub user_id: String,
    pub session_id: String,
    pub device_id: String,
    pub cancel: CancellationToken,
    state: AppState,
    reasoning: Arc<ReasoningLoop>,
    pipeline: OutputPipeline,
    vss_events: Option<mpsc::Sender<VssEvent>>,
    /// PCM format assumed for unframed binary audio.
    pcm_format: Mutex<(i32, i16)>,
}

impl Session {
    /// Register the device + endpoint and wire up the voice stream
    /// for audio-capable connections.
    pub fn start(
        state: AppState,
        caps: Capabilities,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Arc<Self> {
        let user_id = uuid::Uuid::new_v4().to_string();
        let session_id = uuid::Uuid::new_v4().to_string();
        let device_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        // Device + endpoint registration.
        state
            .registry
            .upsert_device(Device::new(&user_id, &device_id, &session_id, caps));
        let endpoint = Arc::new(WsEndpoint::new(
            format!("ws-{device_id}"),
            caps,
            outbound,
        ));
        if let Err(e) = state.registry.attach_endpoint(&user_id, &device_id, endpoint) {
            tracing::error!(error = %e, "endpoint attach failed");
        }

        // Tool execution context for this session's owner. Identity
        // comes from the (external) authenticator; placeholders here.
        let short = &user_id[..8];
        let mut executor = ToolExecutor::new();
        executor.set_user_context(UserContext {
            user_id: user_id.clone(),
            username: format!("user-{short}"),
            email: format!("user-{short}@chorus.local"),
        });

        let reasoning = Arc::new(ReasoningLoop::new(
            state.router.clone(),
            state.tools.clone(),
            Arc::new(executor),
            state.config.reasoning.clone(),
            state.config.providers.default_model.clone(),
        ));
        let pipeline = OutputPipeline::new(
            state.publisher.clone(),
            state.tts.clone(),
            state.config.pipeline.clone(),
        );

        // Voice stream + bridge for sessions that send audio.
        let vss_events = if caps.audio_write {
            let (vss_tx, vss_rx) = VoiceStream::spawn(
                cancel.child_token(),
                state.config.voice.clone(),
                state.stt.clone(),
                state.vad.clone(),
            );
            spawn_bridge(
                vss_rx,
                vss_tx.clone(),
                reasoning.clone(),
                pipeline.clone(),
                state.publisher.clone(),
                cancel.clone(),
                user_id.clone(),
                session_id.clone(),
            );
            Some(vss_tx)
        } else {
            None
        };

        let default_rate = state.config.voice.default_sample_rate;
        state.sessions.insert(
            session_id.clone(),
            SessionHandle {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
                cancel: cancel.clone(),
            },
        );

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            audio = caps.audio_write,
            text = caps.text_sink,
            "session started"
        );

        Arc::new(Self {
            user_id,
            session_id,
            device_id,
            cancel,
            state,
            reasoning,
            pipeline,
            vss_events,
            pcm_format: Mutex::new((default_rate, 1)),
        })
    }

    /// Run one text exchange in the background.
    pub fn handle_text(self: &Arc<Self>, text: String) {
        let session = self.clone();
        tokio::spawn(async move {
            session.touch();
            run_exchange(
                &session.reasoning,
                &session.pipeline,
                &session.cancel,
                &session.user_id,
                &session.session_id,
                text,
            )
            .await;
        });
    }

    /// Feed an audio frame to the voice stream. Frames are dropped
    /// when the session has no audio path or the stream is backed up.
    pub fn handle_audio_frame(&self, frame: AudioInput) {
        self.touch();
        match &self.vss_events {
            Some(tx) => {
                if tx.try_send(VssEvent::Audio(frame)).is_err() {
                    tracing::debug!(session_id = %self.session_id, "voice queue full; frame dropped");
                }
            }
            None => {
                tracing::debug!(session_id = %self.session_id, "audio frame on text-only session");
            }
        }
    }

    /// Map a listening-control action onto the voice stream hooks.
    pub fn handle_listening_control(&self, action: &str) {
        let Some(tx) = &self.vss_events else {
            return;
        };
        let event = match action {
            "stop" => VssEvent::StopListening,
            "resume" => VssEvent::ResumeListening,
            "need_more_context" => VssEvent::NeedMoreContext,
            other => {
                tracing::debug!(action = %other, "unknown listening control");
                return;
            }
        };
        let _ = tx.try_send(event);
    }

    /// Record the PCM format announced for unframed audio.
    pub fn set_pcm_format(&self, sample_rate: i32, channels: i16) {
        *self.pcm_format.lock() = (sample_rate.max(1), channels.max(1));
    }

    pub fn pcm_format(&self) -> (i32, i16) {
        *self.pcm_format.lock()
    }

    pub fn has_audio_path(&self) -> bool {
        self.vss_events.is_some()
    }

    fn touch(&self) {
        let _ = self
            .state
            .registry
            .touch_device(&self.user_id, &self.device_id);
    }

    /// Tear down: cancel children, drop registrations.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.state.sessions.remove(&self.session_id);
        if let Err(e) = self
            .state
            .registry
            .remove_device(&self.user_id, &self.device_id)
        {
            tracing::debug!(error = %e, "device already removed");
        }
        tracing::info!(session_id = %self.session_id, "session closed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exchange & bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One full user turn: reasoning streamed into an output pipeline.
async fn run_exchange(
    reasoning: &ReasoningLoop,
    pipeline: &OutputPipeline,
    cancel: &CancellationToken,
    user_id: &str,
    session_id: &str,
    user_text: String,
) {
    let exchange_cancel = cancel.child_token();
    let (delta_tx, delta_rx) = mpsc::channel(64);

    let pipe = {
        let pipeline = pipeline.clone();
        let cancel = exchange_cancel.clone();
        let (user_id, session_id) = (user_id.to_string(), session_id.to_string());
        tokio::spawn(async move { pipeline.run(cancel, &user_id, &session_id, delta_rx).await })
    };

    let messages = vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(user_text),
    ];
    match reasoning
        .run(exchange_cancel.clone(), messages, Some(delta_tx))
        .await
    {
        Ok(answer) => {
            tracing::debug!(user_id = %user_id, chars = answer.len(), "exchange complete");
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "exchange failed");
        }
    }

    match pipe.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "pipeline finished with error"),
        Err(e) => tracing::warn!(error = %e, "pipeline task panicked"),
    }
    exchange_cancel.cancel();
}

/// Translate voice-stream outputs into reasoning invocations and
/// client-visible listening state.
#[allow(clippy::too_many_arguments)]
fn spawn_bridge(
    mut vss_rx: mpsc::Receiver<VssOutput>,
    vss_tx: mpsc::Sender<VssEvent>,
    reasoning: Arc<ReasoningLoop>,
    pipeline: OutputPipeline,
    publisher: Publisher,
    cancel: CancellationToken,
    user_id: String,
    session_id: String,
) {
    tokio::spawn(async move {
        while let Some(output) = vss_rx.recv().await {
            match output {
                VssOutput::ModeChange { mode } => {
                    let mode = match mode {
                        ListenMode::Passive => "passive",
                        ListenMode::Active => "active",
                    };
                    let _ = publisher
                        .send_event(
                            &user_id,
                            &session_id,
                            "listening_state",
                            serde_json::json!({
                                "mode": mode,
                                "timestamp": Utc::now().to_rfc3339(),
                            }),
                        )
                        .await;
                }
                VssOutput::Interrupt(interrupt) => {
                    let text = interrupt.text.trim().to_string();
                    if text.is_empty() {
                        let _ = vss_tx.send(VssEvent::AudProcDone).await;
                        continue;
                    }
                    tracing::info!(user_id = %user_id, chars = text.len(), "voice interrupt");
                    run_exchange(
                        &reasoning,
                        &pipeline,
                        &cancel,
                        &user_id,
                        &session_id,
                        text,
                    )
                    .await;
                    let _ = vss_tx.send(VssEvent::AudProcDone).await;
                }
            }
        }
        tracing::debug!(session_id = %session_id, "voice bridge ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_map_cancels_by_device() {
        let map = SessionMap::new();
        let cancel = CancellationToken::new();
        map.insert(
            "s1".into(),
            SessionHandle {
                user_id: "u1".into(),
                device_id: "d1".into(),
                cancel: cancel.clone(),
            },
        );

        assert!(!map.cancel_for_device("u1", "ghost"));
        assert!(map.cancel_for_device("u1", "d1"));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn session_map_remove() {
        let map = SessionMap::new();
        map.insert(
            "s1".into(),
            SessionHandle {
                user_id: "u1".into(),
                device_id: "d1".into(),
                cancel: CancellationToken::new(),
            },
        );
        assert_eq!(map.len(), 1);
        assert!(map.remove("s1").is_some());
        assert!(map.remove("s1").is_none());
        assert!(map.is_empty());
    }
}
