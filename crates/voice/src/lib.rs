//! Voice stack: the per-session voice streaming state machine and the
//! STT/VAD/TTS service clients it drives.

pub mod stt;
pub mod tts;
pub mod vad;
pub mod vss;
pub mod wav;

pub use stt::{SpeechToText, SttClient};
pub use tts::{SpeechSynthesizer, TtsClient};
pub use vad::VadClient;
pub use vss::{InterruptEvent, ListenMode, VoiceStream, VssEvent, VssOutput};
