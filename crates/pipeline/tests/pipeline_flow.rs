//! Output pipeline end-to-end: text fan-out, segmentation, synthesis,
//! audio framing, and the event protocol, against fakes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::config::PipelineConfig;
use chorus_domain::stream::ResponseDelta;
use chorus_domain::Result;
use chorus_pipeline::OutputPipeline;
use chorus_registry::{Capabilities, Device, DeviceRegistry, Endpoint, Publisher};
use chorus_voice::tts::{PcmStream, SpeechSynthesizer};

// ── Fakes ──────────────────────────────────────────────────────────

/// TTS that emits each segment's bytes as "PCM", split in two chunks.
struct EchoTts {
    segments: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl SpeechSynthesizer for EchoTts {
    async fn synthesize(&self, text: &str) -> Result<PcmStream> {
        self.segments.lock().push(text.to_string());
        let bytes = text.as_bytes().to_vec();
        let mid = bytes.len() / 2;
        let (a, b) = (bytes[..mid].to_vec(), bytes[mid..].to_vec());
        Ok(Box::pin(async_stream::stream! {
            if !a.is_empty() {
                yield Ok(Bytes::from(a));
            }
            if !b.is_empty() {
                yield Ok(Bytes::from(b));
            }
        }))
    }
}

#[derive(Default)]
struct SinkEndpoint {
    texts: Mutex<Vec<(u64, String)>>,
    frames: Mutex<Vec<(u64, Bytes)>>,
    events: Mutex<Vec<(String, serde_json::Value)>>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Endpoint for SinkEndpoint {
    fn id(&self) -> &str {
        "sink"
    }
    fn caps(&self) -> Capabilities {
        Capabilities::full()
    }
    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn send_text_delta(&self, _s: &str, sequence: u64, text: &str) -> Result<()> {
        self.texts.lock().push((sequence, text.to_string()));
        Ok(())
    }
    async fn send_audio_frame(&self, _s: &str, sequence: u64, frame: Bytes) -> Result<()> {
        self.frames.lock().push((sequence, frame));
        Ok(())
    }
    async fn send_event(&self, _s: &str, name: &str, payload: serde_json::Value) -> Result<()> {
        self.events.lock().push((name.to_string(), payload));
        Ok(())
    }
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct Rig {
    pipeline: OutputPipeline,
    endpoint: Arc<SinkEndpoint>,
    tts: Arc<EchoTts>,
}

fn rig(cfg: PipelineConfig) -> Rig {
    let registry = Arc::new(DeviceRegistry::new());
    registry.upsert_device(Device::new("u1", "d1", "s1", Capabilities::full()));
    let endpoint = Arc::new(SinkEndpoint::default());
    registry.attach_endpoint("u1", "d1", endpoint.clone()).unwrap();

    let tts = Arc::new(EchoTts {
        segments: Mutex::new(Vec::new()),
    });
    Rig {
        pipeline: OutputPipeline::new(Publisher::new(registry), tts.clone(), cfg),
        endpoint,
        tts,
    }
}

fn small_cfg() -> PipelineConfig {
    PipelineConfig {
        min_chars: 4,
        max_chars: 240,
        ..Default::default()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn full_flow_emits_text_audio_and_events_in_order() {
    let r = rig(small_cfg());
    let (tx, rx) = mpsc::channel(8);

    let run = tokio::spawn({
        let pipeline = r.pipeline.clone();
        async move {
            pipeline
                .run(CancellationToken::new(), "u1", "s1", rx)
                .await
        }
    });

    tx.send(vec![
        ResponseDelta::text(1, "Hello, "),
        ResponseDelta::text(2, "world."),
    ])
    .await
    .unwrap();
    tx.send(vec![ResponseDelta::text(3, " Bye.")]).await.unwrap();
    drop(tx);

    run.await.unwrap().unwrap();

    // Text deltas tagged with max(index) of their batch.
    let texts = r.endpoint.texts.lock();
    assert_eq!(texts.as_slice(), &[
        (2, "Hello, world.".to_string()),
        (3, " Bye.".to_string()),
    ]);

    // Both sentences synthesized, split on their punctuation.
    let segments = r.tts.segments.lock();
    assert_eq!(segments.as_slice(), &["Hello, world.".to_string(), "Bye.".to_string()]);

    // Audio frames: monotonic pump sequence, payload equals the
    // synthesized bytes.
    let frames = r.endpoint.frames.lock();
    assert!(!frames.is_empty());
    let seqs: Vec<u64> = frames.iter().map(|(s, _)| *s).collect();
    assert_eq!(seqs, (1..=frames.len() as u64).collect::<Vec<_>>());
    let audio: Vec<u8> = frames.iter().flat_map(|(_, b)| b.to_vec()).collect();
    assert_eq!(audio, b"Hello, world.Bye.");

    // Event protocol: audio_format first, then audio_complete with
    // the chunk count, then message_complete.
    let events = r.endpoint.events.lock();
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["audio_format", "audio_complete", "message_complete"]);
    assert_eq!(events[0].1["encoding"], "s16le");
    assert_eq!(events[0].1["sampleRate"], 22_050);
    assert_eq!(events[1].1["totalChunks"], frames.len() as u64);
}

#[tokio::test(start_paused = true)]
async fn idle_flush_synthesizes_unterminated_text() {
    let r = rig(small_cfg());
    let (tx, rx) = mpsc::channel(8);

    let run = tokio::spawn({
        let pipeline = r.pipeline.clone();
        async move {
            pipeline
                .run(CancellationToken::new(), "u1", "s1", rx)
                .await
        }
    });

    tx.send(vec![ResponseDelta::text(1, "no punctuation here")])
        .await
        .unwrap();
    // Idle for longer than idle_flush_ms while the channel stays open.
    tokio::time::sleep(std::time::Duration::from_millis(900)).await;

    drop(tx);
    run.await.unwrap().unwrap();

    let segments = r.tts.segments.lock();
    assert_eq!(segments.as_slice(), &["no punctuation here".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn no_endpoints_never_fails_the_pipeline() {
    // Registry without any devices: every publish is NoEndpoints.
    let registry = Arc::new(DeviceRegistry::new());
    let tts = Arc::new(EchoTts {
        segments: Mutex::new(Vec::new()),
    });
    let pipeline = OutputPipeline::new(
        Publisher::new(registry),
        tts,
        small_cfg(),
    );

    let (tx, rx) = mpsc::channel(8);
    let run = tokio::spawn(async move {
        pipeline.run(CancellationToken::new(), "u1", "s1", rx).await
    });
    tx.send(vec![ResponseDelta::text(1, "Anyone there?")])
        .await
        .unwrap();
    drop(tx);

    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn debug_wav_capture_writes_backpatched_file() {
    let dir = tempfile::tempdir().unwrap();
    let wav_path = dir.path().join("debug.wav");
    let mut cfg = small_cfg();
    cfg.debug_wav_path = Some(wav_path.clone());
    let r = rig(cfg);

    let (tx, rx) = mpsc::channel(8);
    let run = tokio::spawn({
        let pipeline = r.pipeline.clone();
        async move {
            pipeline
                .run(CancellationToken::new(), "u1", "s1", rx)
                .await
        }
    });
    tx.send(vec![ResponseDelta::text(1, "Captured audio.")])
        .await
        .unwrap();
    drop(tx);
    run.await.unwrap().unwrap();

    let bytes = std::fs::read(&wav_path).unwrap();
    assert_eq!(&bytes[0..4], b"RIFF");
    let payload = u32::from_le_bytes(bytes[40..44].try_into().unwrap()) as usize;
    assert_eq!(payload, "Captured audio.".len());
    let chunk_size = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    assert_eq!(chunk_size, 36 + payload);
    assert_eq!(bytes.len(), 44 + payload);
}
