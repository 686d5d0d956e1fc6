//! Voice streaming state machine.
//!
//! One actor per audio session. Flow:
//!
//! 1. `Passive`: frames accumulate in a bounded ring; every process
//!    tick the ring is snapshotted, wrapped in a WAV, and sent to STT.
//! 2. A transcription containing the wake token flips the session to
//!    `Active`, seeds the transcription buffer with the post-wake
//!    remainder, and arms the listening timer.
//! 3. In `Active`, new transcriptions keep appending; a gap longer
//!    than the active-silence threshold re-arms the timer.
//! 4. Timer expiry emits one `Interrupt` carrying the concatenated
//!    transcript and drops back to `Passive`.
//!
//! All state lives inside the single run loop; callers interact only
//! through the event/output channels. Cancelling the token ends the
//! loop and closes the output channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::audio::{AudioInput, Transcription};
use chorus_domain::config::VoiceConfig;
use chorus_domain::{Error, Result};

use crate::stt::SpeechToText;
use crate::vad::VadClient;
use crate::wav::encode_wav;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inbound events.
pub enum VssEvent {
    Audio(AudioInput),
    /// Downstream reasoning finished handling the last interrupt.
    AudProcDone,
    NeedMoreContext,
    StopListening,
    ResumeListening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    Passive,
    Active,
}

/// A completed active-listening episode.
#[derive(Debug, Clone, Serialize)]
pub struct InterruptEvent {
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub confidence: f32,
}

/// Outbound events.
#[derive(Debug, Clone)]
pub enum VssOutput {
    Interrupt(InterruptEvent),
    ModeChange { mode: ListenMode },
}

/// Placeholder confidence attached to interrupts until the STT service
/// reports a real score.
const INTERRUPT_CONFIDENCE: f32 = 0.95;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct VoiceStream;

impl VoiceStream {
    /// Spawn the actor. Returns the event sender and the output
    /// receiver; the output channel closes when `cancel` fires or the
    /// event sender is dropped.
    pub fn spawn(
        cancel: CancellationToken,
        cfg: VoiceConfig,
        stt: Arc<dyn SpeechToText>,
        vad: Option<Arc<VadClient>>,
    ) -> (mpsc::Sender<VssEvent>, mpsc::Receiver<VssOutput>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(16);

        let actor = VssActor {
            cfg,
            stt,
            vad,
            mode: ListenMode::Passive,
            audio_buf: VecDeque::new(),
            transcript: String::new(),
            listening_deadline: None,
            last_transcript_at: None,
            episode_started: None,
            is_processing: false,
            out: out_tx,
        };
        tokio::spawn(actor.run(cancel, event_rx));

        (event_tx, out_rx)
    }
}

struct VssActor {
    cfg: VoiceConfig,
    stt: Arc<dyn SpeechToText>,
    vad: Option<Arc<VadClient>>,
    mode: ListenMode,
    audio_buf: VecDeque<AudioInput>,
    /// Concatenated transcriptions of the current active episode.
    transcript: String,
    listening_deadline: Option<tokio::time::Instant>,
    last_transcript_at: Option<tokio::time::Instant>,
    episode_started: Option<DateTime<Utc>>,
    is_processing: bool,
    out: mpsc::Sender<VssOutput>,
}

impl VssActor {
    async fn run(mut self, cancel: CancellationToken, mut events: mpsc::Receiver<VssEvent>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.cfg.process_tick_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            // A far-future stand-in keeps the select arm inert while
            // no listening window is armed.
            let deadline = self.listening_deadline.unwrap_or_else(far_future);

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = tick.tick() => self.process_buffered_audio(&cancel).await,
                _ = tokio::time::sleep_until(deadline), if self.listening_deadline.is_some() => {
                    self.fire_interrupt(&cancel).await;
                }
            }
        }
        tracing::debug!("voice stream loop ended");
        // `out` drops here, closing the output channel.
    }

    fn handle_event(&mut self, event: VssEvent) {
        match event {
            VssEvent::Audio(frame) => {
                // Oversized or overflowing frames are dropped, never
                // fatal to the session.
                if let Err(e) = self.buffer_frame(frame) {
                    tracing::warn!(error = %e, "audio frame dropped");
                }
            }
            VssEvent::AudProcDone => {
                self.is_processing = false;
            }
            // Hooks with intentionally unspecified behavior.
            VssEvent::NeedMoreContext => {
                tracing::debug!("need-more-context hook (no-op)");
            }
            VssEvent::StopListening => {
                tracing::debug!("stop-listening hook (no-op)");
            }
            VssEvent::ResumeListening => {
                tracing::debug!("resume-listening hook (no-op)");
            }
        }
    }

    fn buffer_frame(&mut self, frame: AudioInput) -> Result<()> {
        if frame.data.len() > self.cfg.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: frame.data.len(),
                max: self.cfg.max_frame_bytes,
            });
        }
        self.audio_buf.push_back(frame);
        while self.audio_buf.len() > self.cfg.max_buffer_frames {
            self.audio_buf.pop_front();
        }
        Ok(())
    }

    /// Snapshot and clear the ring, run STT, feed the transcription
    /// through the state machine.
    async fn process_buffered_audio(&mut self, cancel: &CancellationToken) {
        if self.audio_buf.is_empty() {
            return;
        }
        if self.is_processing {
            tracing::trace!("reasoning still handling the last interrupt");
        }

        let frames: Vec<AudioInput> = self.audio_buf.drain(..).collect();
        let sample_rate = frames[0].sample_rate.max(1) as u32;
        let channels = frames[0].channels.max(1) as u16;
        let pcm: Vec<u8> = frames.into_iter().flat_map(|f| f.data).collect();
        let wav = encode_wav(&pcm, sample_rate, channels);

        if let Some(vad) = &self.vad {
            match vad.detect(wav.clone()).await {
                Ok(resp) if !resp.has_voice => {
                    tracing::trace!("VAD: no voice in snapshot; skipping STT");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    // VAD is an optimization; fall through to STT.
                    tracing::debug!(error = %e, "VAD check failed");
                }
            }
        }

        let transcription = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.stt.transcribe(wav) => match result {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, "transcription failed");
                    return;
                }
            },
        };

        if transcription.text.trim().is_empty() {
            return;
        }
        self.handle_transcription(cancel, transcription).await;
    }

    async fn handle_transcription(&mut self, cancel: &CancellationToken, t: Transcription) {
        match self.mode {
            ListenMode::Passive => {
                let Some(remainder) = split_after_wake(&t.text, &self.cfg.wake_token) else {
                    tracing::trace!(text = %t.text, "no wake token");
                    return;
                };
                tracing::info!("wake token detected; listening");
                self.mode = ListenMode::Active;
                self.transcript.clear();
                self.transcript.push_str(remainder);
                self.episode_started = Some(Utc::now());
                let now = tokio::time::Instant::now();
                self.last_transcript_at = Some(now);
                self.listening_deadline =
                    Some(now + Duration::from_millis(self.cfg.silence_threshold_ms));
                self.emit(cancel, VssOutput::ModeChange { mode: ListenMode::Active })
                    .await;
            }
            ListenMode::Active => {
                let now = tokio::time::Instant::now();
                if let Some(last) = self.last_transcript_at {
                    let gap = now.duration_since(last);
                    if gap > Duration::from_millis(self.cfg.active_silence_ms) {
                        self.listening_deadline =
                            Some(now + Duration::from_millis(self.cfg.silence_threshold_ms));
                    }
                }
                self.transcript.push_str(&t.text);
                self.last_transcript_at = Some(now);
            }
        }
    }

    /// The listening window expired: one interrupt per episode.
    async fn fire_interrupt(&mut self, cancel: &CancellationToken) {
        let text = std::mem::take(&mut self.transcript);
        let started_at = self.episode_started.take().unwrap_or_else(Utc::now);
        self.listening_deadline = None;
        self.last_transcript_at = None;
        self.mode = ListenMode::Passive;
        self.is_processing = true;

        tracing::info!(chars = text.len(), "listening window closed; interrupting");
        self.emit(
            cancel,
            VssOutput::Interrupt(InterruptEvent {
                text,
                started_at,
                ended_at: Utc::now(),
                confidence: INTERRUPT_CONFIDENCE,
            }),
        )
        .await;
        self.emit(cancel, VssOutput::ModeChange { mode: ListenMode::Passive })
            .await;
    }

    async fn emit(&self, cancel: &CancellationToken, output: VssOutput) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            sent = self.out.send(output) => {
                if sent.is_err() {
                    tracing::debug!("voice output receiver dropped");
                }
            }
        }
    }
}

/// Case-insensitive wake-token scan; returns the text after the first
/// occurrence. Naive substring match by design.
fn split_after_wake<'a>(text: &'a str, token: &str) -> Option<&'a str> {
    if token.is_empty() {
        return None;
    }
    let haystack = text.to_lowercase();
    let needle = token.to_lowercase();
    let idx = haystack.find(&needle)?;
    // Byte offsets line up for ASCII wake tokens; fall back to the
    // full text if lowercasing shifted things.
    text.get(idx + needle.len()..).or(Some(""))
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86_400)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
