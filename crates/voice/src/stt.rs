//! Speech-to-text client.
//!
//! Uploads a WAV as multipart `audio_file` to `{base}/asr` and accepts
//! either a JSON `{text, language, segments?}` body or a plain-text
//! fallback.

use std::time::Duration;

use chrono::Utc;

use chorus_domain::audio::Transcription;
use chorus_domain::config::VoiceConfig;
use chorus_domain::{Error, Result};

/// Trait seam so the VSS can be driven by a fake in tests.
#[async_trait::async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcription>;
}

pub struct SttClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    initial_prompt: Option<String>,
}

impl SttClient {
    pub fn from_config(cfg: &VoiceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.stt_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(cfg.stt_timeout_secs),
            initial_prompt: cfg.stt_initial_prompt.clone(),
        })
    }
}

#[async_trait::async_trait]
impl SpeechToText for SttClient {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcription> {
        let mut url = format!(
            "{}/asr?task=transcribe&language=en&output=json",
            self.base_url
        );
        if let Some(prompt) = &self.initial_prompt {
            url.push_str("&initial_prompt=");
            url.push_str(&urlencode(prompt));
        }

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("audio_file", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("STT: {e}"))
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Http(format!("STT returned {}", response.status())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        // JSON when the service honors `output=json`; plain text
        // otherwise.
        match serde_json::from_str::<Transcription>(&body) {
            Ok(t) => Ok(t),
            Err(_) => Ok(Transcription {
                text: body.trim().to_string(),
                language: String::new(),
                segments: Vec::new(),
                generated_at: Utc::now(),
            }),
        }
    }
}

/// Minimal percent-encoding for query values.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
