//! WebSocket endpoints and the endpoint implementation backed by a
//! socket's writer task.
//!
//! Flow per connection:
//! 1. Client connects to `/ws` (text+audio), `/ws/text`, or
//!    `/ws/audio` with a `token` query parameter.
//! 2. A session is started: device registered, endpoint attached.
//! 3. Reader loop dispatches envelopes and binary PCM; a writer task
//!    forwards outbound frames to the socket sink.
//! 4. On close or cancellation the session tears down: endpoints
//!    detach, the device is removed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use chorus_domain::audio::AudioInput;
use chorus_domain::{Error, Result};
use chorus_registry::{Capabilities, Endpoint};

use crate::protocol::{self, Envelope};
use crate::session::Session;
use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digest. Hashing
/// normalizes lengths so ct_eq always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound frames & the WS-backed endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the writer task forwards to the socket.
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Endpoint implementation over a connection's outbound channel.
pub struct WsEndpoint {
    id: String,
    caps: Capabilities,
    out: mpsc::Sender<OutboundFrame>,
    alive: AtomicBool,
}

impl WsEndpoint {
    pub fn new(id: String, caps: Capabilities, out: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id,
            caps,
            out,
            alive: AtomicBool::new(true),
        }
    }

    async fn send_frame(&self, frame: OutboundFrame) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::EndpointDead(self.id.clone()));
        }
        if self.out.send(frame).await.is_err() {
            self.alive.store(false, Ordering::Release);
            return Err(Error::EndpointDead(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Endpoint for WsEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn caps(&self) -> Capabilities {
        self.caps
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn send_text_delta(&self, session_id: &str, sequence: u64, text: &str) -> Result<()> {
        self.send_frame(OutboundFrame::Text(protocol::text_delta(
            session_id, sequence, text,
        )))
        .await
    }

    async fn send_audio_frame(&self, session_id: &str, sequence: u64, frame: Bytes) -> Result<()> {
        // Metadata first, then the raw chunk.
        self.send_frame(OutboundFrame::Text(protocol::audio_meta(
            session_id,
            sequence,
            frame.len(),
        )))
        .await?;
        self.send_frame(OutboundFrame::Binary(frame.to_vec())).await
    }

    async fn send_event(
        &self,
        session_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let json = match name {
            "listening_state" => {
                let mode = payload
                    .get("mode")
                    .and_then(|v| v.as_str())
                    .unwrap_or("passive");
                protocol::listening_state(session_id, mode)
            }
            "error" => protocol::error_msg(
                Some(session_id),
                payload.get("code").and_then(|v| v.as_str()).unwrap_or("internal"),
                payload.get("message").and_then(|v| v.as_str()).unwrap_or(""),
            ),
            _ => protocol::event(session_id, name, payload),
        };
        self.send_frame(OutboundFrame::Text(json)).await
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_combined))
        .route("/ws/audio", get(ws_audio))
        .route("/ws/text", get(ws_text))
        .route("/ws/stats", get(stats))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

fn authorized(state: &AppState, query: &WsQuery) -> bool {
    match &state.config.server.auth_token {
        Some(expected) => token_eq(query.token.as_deref().unwrap_or(""), expected),
        // No token configured: open access (dev mode).
        None => true,
    }
}

async fn ws_combined(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    upgrade(ws, state, query, Capabilities::full(), true)
}

async fn ws_audio(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    upgrade(ws, state, query, Capabilities::audio_only(), false)
}

async fn ws_text(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    upgrade(ws, state, query, Capabilities::text_only(), false)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    query: WsQuery,
    caps: Capabilities,
    framed_binary: bool,
) -> axum::response::Response {
    if !authorized(&state, &query) {
        return (axum::http::StatusCode::UNAUTHORIZED, "invalid or missing token")
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, caps, framed_binary))
        .into_response()
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry.stats();
    axum::Json(serde_json::json!({
        "sessions": state.sessions.len(),
        "users": registry.users,
        "devices": registry.devices,
        "endpoints": registry.endpoints,
        "tools": state.tools.len(),
        "models": state.router.known_models(),
    }))
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    caps: Capabilities,
    framed_binary: bool,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: forwards outbound frames to the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let msg = match frame {
                OutboundFrame::Text(text) => Message::Text(text),
                OutboundFrame::Binary(bytes) => Message::Binary(bytes),
            };
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let session = Session::start(state.clone(), caps, outbound_tx.clone());

    // Reader loop.
    loop {
        let msg = tokio::select! {
            _ = session.cancel.cancelled() => break,
            msg = ws_stream.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
        };

        match msg {
            Message::Text(text) => {
                handle_envelope(&session, &outbound_tx, &text).await;
            }
            Message::Binary(bytes) => {
                handle_binary(&session, &outbound_tx, framed_binary, &bytes).await;
            }
            Message::Ping(_) | Message::Pong(_) => {
                let _ = state
                    .registry
                    .touch_device(&session.user_id, &session.device_id);
            }
            Message::Close(_) => break,
        }
    }

    session.shutdown();
    drop(outbound_tx);
    let _ = writer.await;
}

async fn send_error(
    outbound: &mpsc::Sender<OutboundFrame>,
    session_id: &str,
    code: &str,
    message: &str,
) {
    let _ = outbound
        .send(OutboundFrame::Text(protocol::error_msg(
            Some(session_id),
            code,
            message,
        )))
        .await;
}

async fn handle_envelope(
    session: &Arc<Session>,
    outbound: &mpsc::Sender<OutboundFrame>,
    text: &str,
) {
    let envelope = match Envelope::parse(text) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable envelope");
            send_error(outbound, &session.session_id, "validation", &e.to_string()).await;
            return;
        }
    };

    match envelope.kind.as_str() {
        protocol::TYPE_INIT => {
            let _ = outbound
                .send(OutboundFrame::Text(protocol::init_ack(
                    &session.session_id,
                    &session.user_id,
                )))
                .await;
        }
        protocol::TYPE_TEXT => {
            let content = envelope
                .data
                .as_str()
                .map(str::to_string)
                .or_else(|| {
                    envelope
                        .data
                        .get("content")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
            match content {
                Some(content) if !content.trim().is_empty() => session.handle_text(content),
                _ => {
                    send_error(
                        outbound,
                        &session.session_id,
                        "validation",
                        "text message has no content",
                    )
                    .await;
                }
            }
        }
        protocol::TYPE_AUDIO => {
            // JSON audio messages announce the PCM format for
            // subsequent unframed binary frames.
            let rate = envelope
                .data
                .get("sampleRate")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32;
            let channels = envelope
                .data
                .get("channels")
                .and_then(|v| v.as_i64())
                .unwrap_or(1) as i16;
            if rate > 0 {
                session.set_pcm_format(rate, channels);
            } else {
                send_error(
                    outbound,
                    &session.session_id,
                    "validation",
                    "audio announcement needs sampleRate",
                )
                .await;
            }
        }
        protocol::TYPE_LISTENING_CONTROL => {
            let action = envelope
                .data
                .get("action")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            session.handle_listening_control(action);
        }
        other => {
            send_error(
                outbound,
                &session.session_id,
                "unknown_type",
                &format!("unknown message type: {other}"),
            )
            .await;
        }
    }
}

async fn handle_binary(
    session: &Arc<Session>,
    outbound: &mpsc::Sender<OutboundFrame>,
    framed: bool,
    bytes: &[u8],
) {
    if !session.has_audio_path() {
        send_error(
            outbound,
            &session.session_id,
            "validation",
            "binary audio on a text-only session",
        )
        .await;
        return;
    }

    let frame = if framed {
        match protocol::parse_framed_pcm(bytes) {
            Ok((rate, channels, pcm)) => {
                AudioInput::new(rate as i32, channels as i16, pcm.to_vec())
            }
            Err(e) => {
                send_error(outbound, &session.session_id, "validation", &e.to_string()).await;
                return;
            }
        }
    } else {
        let (rate, channels) = session.pcm_format();
        AudioInput::new(rate, channels, bytes.to_vec())
    };

    session.handle_audio_frame(frame);
}
