//! Audio frame type, its little-endian wire codec, and transcription
//! results.
//!
//! Wire layout: `[ts:i64 ns][sample_rate:i32][channels:i16][len:u32][data]`,
//! all little-endian. `decode(encode(x)) == x` for every well-formed x.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed size of the encoded header preceding the PCM payload.
pub const AUDIO_HEADER_LEN: usize = 8 + 4 + 2 + 4;

/// A raw PCM audio frame captured from a client device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInput {
    pub timestamp: DateTime<Utc>,
    pub sample_rate: i32,
    pub channels: i16,
    pub data: Vec<u8>,
}

impl AudioInput {
    pub fn new(sample_rate: i32, channels: i16, data: Vec<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            sample_rate,
            channels,
            data,
        }
    }

    /// Serialize to the internal wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let ts = self.timestamp.timestamp_nanos_opt().unwrap_or(0);
        let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + self.data.len());
        out.extend_from_slice(&ts.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Deserialize from the internal wire layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < AUDIO_HEADER_LEN {
            return Err(Error::Validation(format!(
                "audio frame truncated: {} bytes, header needs {AUDIO_HEADER_LEN}",
                buf.len()
            )));
        }
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&buf[0..8]);
        let ts = i64::from_le_bytes(ts_bytes);
        let mut rate_bytes = [0u8; 4];
        rate_bytes.copy_from_slice(&buf[8..12]);
        let sample_rate = i32::from_le_bytes(rate_bytes);
        let mut chan_bytes = [0u8; 2];
        chan_bytes.copy_from_slice(&buf[12..14]);
        let channels = i16::from_le_bytes(chan_bytes);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[14..18]);
        let data_len = u32::from_le_bytes(len_bytes) as usize;

        let body = &buf[AUDIO_HEADER_LEN..];
        if body.len() != data_len {
            return Err(Error::Validation(format!(
                "audio frame length mismatch: header says {data_len}, body has {}",
                body.len()
            )));
        }

        Ok(Self {
            timestamp: DateTime::from_timestamp_nanos(ts),
            sample_rate,
            channels,
            data: body.to_vec(),
        })
    }

    /// Duration of the PCM payload, assuming 16-bit samples.
    pub fn duration_ms(&self) -> u64 {
        let bytes_per_sec = self.sample_rate as u64 * self.channels as u64 * 2;
        if bytes_per_sec == 0 {
            return 0;
        }
        self.data.len() as u64 * 1000 / bytes_per_sec
    }
}

/// A transcription result from the STT service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<TranscriptionSegment>,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = AudioInput {
            timestamp: DateTime::from_timestamp_nanos(1_712_345_678_901_234_567),
            sample_rate: 16_000,
            channels: 1,
            data: vec![0u8, 1, 2, 3, 250, 251, 252, 253],
        };
        let decoded = AudioInput::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_empty_payload() {
        let frame = AudioInput {
            timestamp: DateTime::from_timestamp_nanos(0),
            sample_rate: 22_050,
            channels: 2,
            data: vec![],
        };
        let decoded = AudioInput::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let frame = AudioInput {
            timestamp: DateTime::from_timestamp_nanos(1),
            sample_rate: 0x0102_0304,
            channels: 0x0506,
            data: vec![0xAA],
        };
        let buf = frame.encode();
        assert_eq!(&buf[0..8], &1i64.to_le_bytes());
        assert_eq!(&buf[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[12..14], &[0x06, 0x05]);
        assert_eq!(&buf[14..18], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(buf[18], 0xAA);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = AudioInput::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut buf = AudioInput::new(16_000, 1, vec![1, 2, 3]).encode();
        buf.pop();
        let err = AudioInput::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn duration_of_one_second_of_mono_16k() {
        let frame = AudioInput::new(16_000, 1, vec![0; 32_000]);
        assert_eq!(frame.duration_ms(), 1000);
    }
}
