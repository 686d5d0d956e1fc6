//! Text-to-speech client.
//!
//! `GET {base}/api/text-to-speech?text=…&voice=…` returns a streaming
//! `audio/wav` body: a 44-byte header followed by s16le PCM at
//! 22050 Hz mono. [`SpeechSynthesizer::synthesize`] yields the bare
//! PCM with the header stripped, so the pipeline frames raw samples.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;

use chorus_domain::config::VoiceConfig;
use chorus_domain::{Error, Result};

use crate::wav::WAV_HEADER_LEN;

pub type PcmStream = Pin<Box<dyn futures_core::Stream<Item = Result<Bytes>> + Send>>;

/// TTS-native output parameters, announced to clients at stream start.
pub const TTS_SAMPLE_RATE: u32 = 22_050;
pub const TTS_CHANNELS: u16 = 1;

/// Trait seam so the output pipeline can be driven by a fake in tests.
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one text segment into a PCM byte stream.
    async fn synthesize(&self, text: &str) -> Result<PcmStream>;
}

pub struct TtsClient {
    client: reqwest::Client,
    base_url: String,
    voice: String,
}

impl TtsClient {
    pub fn from_config(cfg: &VoiceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.tts_url.trim_end_matches('/').to_string(),
            voice: cfg.tts_voice.clone(),
        })
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for TtsClient {
    async fn synthesize(&self, text: &str) -> Result<PcmStream> {
        let response = self
            .client
            .get(format!("{}/api/text-to-speech", self.base_url))
            .query(&[("text", text), ("voice", self.voice.as_str())])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!("TTS returned {}", response.status())));
        }

        // Strip the WAV header spanning however many chunks it takes.
        let stream = async_stream::stream! {
            let mut body = response.bytes_stream();
            let mut to_skip = WAV_HEADER_LEN;
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        if to_skip >= bytes.len() {
                            to_skip -= bytes.len();
                            continue;
                        }
                        let payload = bytes.slice(to_skip..);
                        to_skip = 0;
                        if !payload.is_empty() {
                            yield Ok(payload);
                        }
                    }
                    Err(e) => {
                        yield Err(Error::Http(e.to_string()));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
