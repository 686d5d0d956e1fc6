//! The output pipeline proper.
//!
//! Four cooperating tasks per invocation:
//!
//! 1. reader — consumes delta batches, fans text out to the
//!    publisher (`sequence = max(index)` over the batch) and feeds
//!    the segmenter channel;
//! 2. segmenter — applies the flush rules, including the timed
//!    comma/idle flushes;
//! 3. synth — synthesizes each segment and writes PCM into an
//!    internal pipe (plus the optional debug WAV capture);
//! 4. pump — reads the pipe in fixed-size chunks and publishes
//!    audio frames with a monotonic `audio_seq`.
//!
//! Text deltas keep the LLM's delta indices; audio frames use the
//! pump's own counter. The two streams are not synchronized.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::config::PipelineConfig;
use chorus_domain::stream::DeltaBatch;
use chorus_domain::{Error, Result};
use chorus_registry::Publisher;
use chorus_voice::tts::{SpeechSynthesizer, TTS_CHANNELS, TTS_SAMPLE_RATE};
use chorus_voice::wav::WavCapture;

use crate::segmenter::Segmenter;

/// Size of the in-process PCM pipe between synth and pump.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone)]
pub struct OutputPipeline {
    publisher: Publisher,
    tts: Arc<dyn SpeechSynthesizer>,
    cfg: PipelineConfig,
}

impl OutputPipeline {
    pub fn new(publisher: Publisher, tts: Arc<dyn SpeechSynthesizer>, cfg: PipelineConfig) -> Self {
        Self {
            publisher,
            tts,
            cfg,
        }
    }

    /// Drive one reasoning invocation's delta stream to completion.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        user_id: &str,
        session_id: &str,
        deltas: mpsc::Receiver<DeltaBatch>,
    ) -> Result<()> {
        // Announce the audio format before any frame.
        let _ = self
            .publisher
            .send_event(
                user_id,
                session_id,
                "audio_format",
                serde_json::json!({
                    "format": "pcm",
                    "sampleRate": TTS_SAMPLE_RATE,
                    "channels": TTS_CHANNELS,
                    "bitsPerSample": 16,
                    "encoding": "s16le",
                }),
            )
            .await;

        let (chunk_tx, chunk_rx) = mpsc::channel::<String>(self.cfg.text_channel_capacity);
        let (seg_tx, seg_rx) = mpsc::channel::<String>(8);
        let (pipe_reader, pipe_writer) = tokio::io::simplex(PIPE_CAPACITY);

        let reader = tokio::spawn(run_reader(
            self.publisher.clone(),
            user_id.to_string(),
            session_id.to_string(),
            cancel.clone(),
            deltas,
            chunk_tx,
        ));
        let segmenter = tokio::spawn(run_segmenter(
            self.cfg.clone(),
            cancel.clone(),
            chunk_rx,
            seg_tx,
        ));
        let synth = tokio::spawn(run_synth(
            self.tts.clone(),
            self.cfg.clone(),
            cancel.clone(),
            seg_rx,
            pipe_writer,
        ));
        let pump = tokio::spawn(run_pump(
            self.publisher.clone(),
            user_id.to_string(),
            session_id.to_string(),
            self.cfg.chunk_bytes,
            cancel.clone(),
            pipe_reader,
        ));

        // Text path first; then give the audio path a bounded window
        // to drain before declaring the message complete.
        let _ = reader.await;
        let _ = segmenter.await;
        let _ = synth.await;
        let drain = Duration::from_secs(self.cfg.drain_timeout_secs);
        if tokio::time::timeout(drain, pump).await.is_err() {
            tracing::warn!(user_id = %user_id, "audio drain timeout");
        }

        let _ = self
            .publisher
            .send_event(
                user_id,
                session_id,
                "message_complete",
                serde_json::json!({ "timestamp": Utc::now().to_rfc3339() }),
            )
            .await;

        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_reader(
    publisher: Publisher,
    user_id: String,
    session_id: String,
    cancel: CancellationToken,
    mut deltas: mpsc::Receiver<DeltaBatch>,
    chunk_tx: mpsc::Sender<String>,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = deltas.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let sequence = batch.iter().map(|d| d.index).max().unwrap_or(0);
        let text: String = batch.iter().filter_map(|d| d.msg.as_deref()).collect();
        if text.is_empty() {
            continue;
        }

        match publisher
            .send_text_delta(&user_id, &session_id, sequence, &text)
            .await
        {
            Ok(()) => {}
            Err(Error::NoEndpoints(_)) => {
                tracing::debug!(user_id = %user_id, "text delta dropped: no sinks");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "text delta publish failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = chunk_tx.send(text) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_segmenter(
    cfg: PipelineConfig,
    cancel: CancellationToken,
    mut chunk_rx: mpsc::Receiver<String>,
    seg_tx: mpsc::Sender<String>,
) {
    let mut segmenter = Segmenter::new(&cfg);
    let comma_delay = Duration::from_millis(cfg.comma_delay_ms);
    let idle_flush = Duration::from_millis(cfg.idle_flush_ms);
    let mut last_push: Option<tokio::time::Instant> = None;

    loop {
        let deadline = match last_push {
            Some(at) if !segmenter.is_empty() => {
                let hold = if segmenter.has_trailing_comma() {
                    comma_delay
                } else {
                    idle_flush
                };
                Some(at + hold)
            }
            _ => None,
        };
        let timer = deadline
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = chunk_rx.recv() => match chunk {
                Some(text) => {
                    for segment in segmenter.push(&text) {
                        if seg_tx.send(segment).await.is_err() {
                            return;
                        }
                    }
                    last_push = Some(tokio::time::Instant::now());
                }
                None => break,
            },
            _ = tokio::time::sleep_until(timer), if deadline.is_some() => {
                if let Some(segment) = segmenter.flush() {
                    if seg_tx.send(segment).await.is_err() {
                        return;
                    }
                }
                last_push = None;
            }
        }
    }

    // Forced flush on upstream close or cancellation.
    if let Some(segment) = segmenter.flush() {
        let _ = seg_tx.send(segment).await;
    }
}

async fn run_synth(
    tts: Arc<dyn SpeechSynthesizer>,
    cfg: PipelineConfig,
    cancel: CancellationToken,
    mut seg_rx: mpsc::Receiver<String>,
    mut pipe: tokio::io::WriteHalf<tokio::io::SimplexStream>,
) {
    let tts_timeout = Duration::from_secs(cfg.tts_timeout_secs);
    let mut capture = cfg.debug_wav_path.as_deref().and_then(|path| {
        match WavCapture::create(path, TTS_SAMPLE_RATE, TTS_CHANNELS) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "debug WAV capture unavailable");
                None
            }
        }
    });

    loop {
        let segment = tokio::select! {
            _ = cancel.cancelled() => break,
            segment = seg_rx.recv() => match segment {
                Some(s) => s,
                None => break,
            },
        };

        let stream = match tokio::time::timeout(tts_timeout, tts.synthesize(&segment)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "synthesis failed; segment skipped");
                continue;
            }
            Err(_) => {
                tracing::warn!(chars = segment.len(), "synthesis timed out; segment skipped");
                continue;
            }
        };

        let mut stream = stream;
        while let Some(chunk) = tokio::select! {
            _ = cancel.cancelled() => None,
            chunk = stream.next() => chunk,
        } {
            match chunk {
                Ok(bytes) => {
                    if let Some(c) = capture.as_mut() {
                        // Capture is best-effort; it never gates
                        // streaming.
                        if let Err(e) = c.write(&bytes) {
                            tracing::warn!(error = %e, "debug WAV write failed; capture disabled");
                            capture = None;
                        }
                    }
                    if pipe.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "synthesis stream error; segment truncated");
                    break;
                }
            }
        }
    }

    if let Some(c) = capture {
        if let Err(e) = c.finish() {
            tracing::warn!(error = %e, "debug WAV finalize failed");
        }
    }
    // `pipe` drops here: EOF for the pump.
}

async fn run_pump(
    publisher: Publisher,
    user_id: String,
    session_id: String,
    chunk_bytes: usize,
    cancel: CancellationToken,
    mut pipe: tokio::io::ReadHalf<tokio::io::SimplexStream>,
) {
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut audio_seq: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = pipe.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "audio pipe read failed");
                    break;
                }
            },
        };

        audio_seq += 1;
        let frame = Bytes::copy_from_slice(&buf[..n]);
        match publisher
            .send_audio_frame(&user_id, &session_id, audio_seq, frame)
            .await
        {
            Ok(()) => {}
            Err(Error::NoEndpoints(_)) | Err(Error::EndpointDead(_)) => {
                tracing::debug!(user_id = %user_id, seq = audio_seq, "audio frame dropped");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "audio frame publish failed");
            }
        }
    }

    let _ = publisher
        .send_event(
            &user_id,
            &session_id,
            "audio_complete",
            serde_json::json!({
                "timestamp": Utc::now().to_rfc3339(),
                "totalChunks": audio_seq,
            }),
        )
        .await;
}
