//! Voice activity detection client (optional gate ahead of STT).

use std::time::Duration;

use serde::Deserialize;

use chorus_domain::config::VoiceConfig;
use chorus_domain::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct VadResponse {
    pub has_voice: bool,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub segments: Vec<VadSegment>,
    #[serde(default)]
    pub processing_time_ms: f64,
    #[serde(default)]
    pub audio_duration_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VadSegment {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub confidence: f32,
}

pub struct VadClient {
    client: reqwest::Client,
    base_url: String,
    sampling_rate: i32,
}

impl VadClient {
    /// Detection thresholds sent with every request.
    const THRESHOLD: f32 = 0.5;
    const MIN_SPEECH_MS: u32 = 250;
    const MIN_SILENCE_MS: u32 = 100;

    pub fn from_config(cfg: &VoiceConfig) -> Result<Option<Self>> {
        let Some(url) = &cfg.vad_url else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Some(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            sampling_rate: cfg.default_sample_rate,
        }))
    }

    pub async fn detect(&self, wav: Vec<u8>) -> Result<VadResponse> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("threshold", Self::THRESHOLD.to_string())
            .text("min_speech_duration_ms", Self::MIN_SPEECH_MS.to_string())
            .text("min_silence_duration_ms", Self::MIN_SILENCE_MS.to_string())
            .text("sampling_rate", self.sampling_rate.to_string());

        let response = self
            .client
            .post(format!("{}/vad", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!("VAD returned {}", response.status())));
        }

        response
            .json::<VadResponse>()
            .await
            .map_err(|e| Error::Http(e.to_string()))
    }
}
