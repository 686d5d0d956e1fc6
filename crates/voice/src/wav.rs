//! Canonical 44-byte PCM WAV header, plus the debug capture writer.
//!
//! Header layout (all little-endian):
//!
//! ```text
//! 00 'RIFF'   04 chunkSize(=36+data)  08 'WAVE'
//! 12 'fmt '   16 subchunk1Size=16     20 audioFormat=1
//! 22 channels    24 sampleRate        28 byteRate
//! 32 blockAlign  34 bitsPerSample
//! 36 'data'   40 subchunk2Size=data
//! ```

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use chorus_domain::Result;

pub const WAV_HEADER_LEN: usize = 44;
pub const BITS_PER_SAMPLE: u16 = 16;

/// Build the canonical header for a known payload length.
pub fn wav_header(data_len: u32, sample_rate: u32, channels: u16) -> [u8; WAV_HEADER_LEN] {
    let block_align = channels * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * block_align as u32;

    let mut h = [0u8; WAV_HEADER_LEN];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes());
    h[22..24].copy_from_slice(&channels.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

/// Wrap raw PCM in a complete WAV (used for STT/VAD uploads).
pub fn encode_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    out.extend_from_slice(&wav_header(pcm.len() as u32, sample_rate, channels));
    out.extend_from_slice(pcm);
    out
}

/// Debug capture: streams synthesized bytes into a WAV file whose size
/// fields are back-patched on close. Write failures are the caller's
/// to log; they must never gate streaming.
pub struct WavCapture {
    file: std::fs::File,
    data_len: u32,
}

impl WavCapture {
    /// Create the file and write a placeholder header.
    pub fn create(path: &Path, sample_rate: u32, channels: u16) -> Result<Self> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&wav_header(0, sample_rate, channels))?;
        Ok(Self { file, data_len: 0 })
    }

    pub fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.file.write_all(pcm)?;
        self.data_len += pcm.len() as u32;
        Ok(())
    }

    /// Back-patch `chunkSize` and `subchunk2Size`, then flush.
    pub fn finish(mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(4))?;
        self.file.write_all(&(36 + self.data_len).to_le_bytes())?;
        self.file.seek(SeekFrom::Start(40))?;
        self.file.write_all(&self.data_len.to_le_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matches_canonical_layout() {
        let h = wav_header(1000, 22_050, 1);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(h[4..8].try_into().unwrap()), 1036);
        assert_eq!(&h[8..12], b"WAVE");
        assert_eq!(u16::from_le_bytes(h[20..22].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(h[22..24].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(h[24..28].try_into().unwrap()), 22_050);
        assert_eq!(u32::from_le_bytes(h[28..32].try_into().unwrap()), 44_100);
        assert_eq!(u16::from_le_bytes(h[32..34].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes(h[34..36].try_into().unwrap()), 16);
        assert_eq!(&h[36..40], b"data");
        assert_eq!(u32::from_le_bytes(h[40..44].try_into().unwrap()), 1000);
    }

    #[test]
    fn capture_back_patches_sizes_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");

        let mut capture = WavCapture::create(&path, 22_050, 1).unwrap();
        capture.write(&[0u8; 300]).unwrap();
        capture.write(&[1u8; 212]).unwrap();
        capture.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        let payload = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
        assert_eq!(payload, 512);
        let chunk_size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(chunk_size, 36 + payload);
        assert_eq!(bytes.len(), WAV_HEADER_LEN + 512);
    }

    #[test]
    fn encode_wav_prepends_header() {
        let wav = encode_wav(&[9u8; 10], 16_000, 1);
        assert_eq!(wav.len(), 54);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[44..], &[9u8; 10]);
    }
}
