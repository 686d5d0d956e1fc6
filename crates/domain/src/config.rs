//! Configuration tree: TOML file merged with environment overrides.
//!
//! Every knob has a serde default so an empty file (or no file) yields
//! a runnable configuration pointed at localhost services.

use serde::{Deserialize, Serialize};

use crate::stream::SelectedModel;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

impl Config {
    /// Apply environment overrides for deployment-critical values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CHORUS_BIND") {
            self.server.bind = v;
        }
        if let Ok(v) = std::env::var("CHORUS_AUTH_TOKEN") {
            self.server.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("CHORUS_STT_URL") {
            self.voice.stt_url = v;
        }
        if let Ok(v) = std::env::var("CHORUS_VAD_URL") {
            self.voice.vad_url = Some(v);
        }
        if let Ok(v) = std::env::var("CHORUS_TTS_URL") {
            self.voice.tts_url = v;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `127.0.0.1:8080`.
    #[serde(default = "d_bind")]
    pub bind: String,
    /// Opaque token expected in the `token` query parameter. `None`
    /// disables the check (dev mode).
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: d_bind(),
            auth_token: None,
        }
    }
}

fn d_bind() -> String {
    "127.0.0.1:8080".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Providers & routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI chat-completions wire format over SSE (OpenAI, vLLM,
    /// LM Studio, Together, …).
    OpenaiCompat,
    /// Ollama native `/api/chat` NDJSON streaming.
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Canonical models this adapter serves.
    pub models: Vec<SelectedModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Model used when the route policy has no stronger opinion.
    #[serde(default = "d_default_model")]
    pub default_model: SelectedModel,
    #[serde(default = "d_providers")]
    pub entries: Vec<ProviderEntry>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_model: d_default_model(),
            entries: d_providers(),
        }
    }
}

fn d_default_model() -> SelectedModel {
    SelectedModel::new("llama3.1:8b-instruct", "8b")
}

fn d_providers() -> Vec<ProviderEntry> {
    vec![ProviderEntry {
        id: "ollama".into(),
        kind: ProviderKind::Ollama,
        base_url: "http://127.0.0.1:11434".into(),
        api_key: None,
        models: vec![d_default_model()],
    }]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter batching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Flush the delta buffer when it reaches this many items.
    #[serde(default = "d_24")]
    pub delta_buffer_limit: usize,
    /// Flush the delta buffer when this much time has elapsed.
    #[serde(default = "d_150")]
    pub delta_time_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            delta_buffer_limit: 24,
            delta_time_ms: 150,
        }
    }
}

fn d_24() -> usize {
    24
}
fn d_150() -> u64 {
    150
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reasoning loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Tool-call budget for one reasoning invocation.
    #[serde(default = "d_8")]
    pub max_tool_calls: usize,
    /// Protective read timeout for one round.
    #[serde(default = "d_30")]
    pub round_timeout_secs: u64,
    /// Capacity of the internal per-round delta channel.
    #[serde(default = "d_32")]
    pub delta_channel_capacity: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 8,
            round_timeout_secs: 30,
            delta_channel_capacity: 32,
        }
    }
}

fn d_8() -> usize {
    8
}
fn d_30() -> u64 {
    30
}
fn d_32() -> usize {
    32
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Terminal punctuation that flushes the segment buffer.
    #[serde(default = "d_flush_punct")]
    pub flush_punct: String,
    /// Flush when the buffer reaches this length.
    #[serde(default = "d_240")]
    pub max_chars: usize,
    /// Fragments shorter than this are held back unless forced.
    #[serde(default = "d_40")]
    pub min_chars: usize,
    /// Flush on a trailing comma held this long.
    #[serde(default = "d_600")]
    pub comma_delay_ms: u64,
    /// Flush when no new text arrives for this long.
    #[serde(default = "d_700")]
    pub idle_flush_ms: u64,
    /// Audio pump chunk size.
    #[serde(default = "d_4096")]
    pub chunk_bytes: usize,
    /// Wait this long for both paths to drain before message_complete.
    #[serde(default = "d_10")]
    pub drain_timeout_secs: u64,
    /// Per-segment TTS timeout.
    #[serde(default = "d_20")]
    pub tts_timeout_secs: u64,
    /// Capacity of the text-chunk channel feeding the segmenter.
    #[serde(default = "d_64")]
    pub text_channel_capacity: usize,
    /// When set, every synthesized byte is also written to this WAV
    /// file. Development aid; never gates streaming.
    #[serde(default)]
    pub debug_wav_path: Option<std::path::PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_punct: d_flush_punct(),
            max_chars: 240,
            min_chars: 40,
            comma_delay_ms: 600,
            idle_flush_ms: 700,
            chunk_bytes: 4096,
            drain_timeout_secs: 10,
            tts_timeout_secs: 20,
            text_channel_capacity: 64,
            debug_wav_path: None,
        }
    }
}

fn d_flush_punct() -> String {
    ".!?;:".into()
}
fn d_240() -> usize {
    240
}
fn d_40() -> usize {
    40
}
fn d_600() -> u64 {
    600
}
fn d_700() -> u64 {
    700
}
fn d_4096() -> usize {
    4096
}
fn d_10() -> u64 {
    10
}
fn d_20() -> u64 {
    20
}
fn d_64() -> usize {
    64
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Literal substring that wakes the session (case-insensitive).
    #[serde(default = "d_wake")]
    pub wake_token: String,
    /// Interval at which buffered audio is submitted to STT.
    #[serde(default = "d_2000")]
    pub process_tick_ms: u64,
    /// Active-mode listening window armed after the wake word.
    #[serde(default = "d_2000")]
    pub silence_threshold_ms: u64,
    /// Inter-utterance gap that re-arms the listening window.
    #[serde(default = "d_700")]
    pub active_silence_ms: u64,
    /// Audio ring buffer capacity in frames. Oldest frames drop first.
    #[serde(default = "d_100")]
    pub max_buffer_frames: usize,
    /// Frames larger than this are rejected outright.
    #[serde(default = "d_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Sample rate assumed for bare PCM (no framing header).
    #[serde(default = "d_16000")]
    pub default_sample_rate: i32,
    #[serde(default = "d_stt_url")]
    pub stt_url: String,
    /// Optional VAD gate ahead of STT.
    #[serde(default)]
    pub vad_url: Option<String>,
    #[serde(default = "d_tts_url")]
    pub tts_url: String,
    #[serde(default = "d_voice")]
    pub tts_voice: String,
    #[serde(default = "d_10")]
    pub stt_timeout_secs: u64,
    /// Hint passed to the STT service as `initial_prompt`.
    #[serde(default)]
    pub stt_initial_prompt: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            wake_token: d_wake(),
            process_tick_ms: 2000,
            silence_threshold_ms: 2000,
            active_silence_ms: 700,
            max_buffer_frames: 100,
            max_frame_bytes: d_frame_bytes(),
            default_sample_rate: 16_000,
            stt_url: d_stt_url(),
            vad_url: None,
            tts_url: d_tts_url(),
            tts_voice: d_voice(),
            stt_timeout_secs: 10,
            stt_initial_prompt: None,
        }
    }
}

fn d_wake() -> String {
    "xarvis".into()
}
fn d_2000() -> u64 {
    2000
}
fn d_100() -> usize {
    100
}
fn d_frame_bytes() -> usize {
    1024 * 1024
}
fn d_16000() -> i32 {
    16_000
}
fn d_stt_url() -> String {
    "http://127.0.0.1:9000".into()
}
fn d_tts_url() -> String {
    "http://127.0.0.1:5500".into()
}
fn d_voice() -> String {
    "en_US-lessac-medium".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sessions idle longer than this are closed by the sweeper.
    #[serde(default = "d_idle_mins")]
    pub idle_timeout_mins: u64,
    /// Sweep interval.
    #[serde(default = "d_sweep_mins")]
    pub sweep_interval_mins: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_mins: 30,
            sweep_interval_mins: 5,
        }
    }
}

fn d_idle_mins() -> u64 {
    30
}
fn d_sweep_mins() -> u64 {
    5
}
