//! # Media Value Types
//!
//! Audio chunks and video frames as they move between clients, the relay
//! queues and the synthesis engine. Both are moved from stage to stage, never
//! shared: whoever pulls a chunk out of a queue owns it.
//!
//! ## Audio Format:
//! - **Encoding**: Little-endian signed 16-bit PCM
//! - **Channels**: Mono
//! - **Storage**: Raw bytes, so the wire payload can be forwarded without re-packing

use actix_web::web::Bytes;
use byteorder::{ByteOrder, LittleEndian};

/// Seconds since the Unix epoch as a double, the timestamp format used on the wire.
pub fn wall_clock_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// A run of mono int16 PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Little-endian int16 samples
    pub pcm: Bytes,
    /// Samples per second
    pub sample_rate: u32,
    /// Capture (inbound) or production (engine output) time, seconds since epoch
    pub timestamp: f64,
}

impl AudioChunk {
    pub fn new(pcm: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
            timestamp: wall_clock_secs(),
        }
    }

    /// Build a chunk from decoded samples.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        let mut pcm = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut pcm);
        Self::new(pcm, sample_rate)
    }

    /// A chunk of digital silence.
    pub fn silence(byte_len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0u8; byte_len], sample_rate)
    }

    pub fn byte_len(&self) -> usize {
        self.pcm.len()
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count() as f64 / self.sample_rate as f64
    }

    /// Decode the samples (a trailing odd byte is ignored).
    #[cfg(test)]
    pub fn samples(&self) -> Vec<i16> {
        let whole = self.sample_count() * 2;
        let mut samples = vec![0i16; self.sample_count()];
        LittleEndian::read_i16_into(&self.pcm[..whole], &mut samples);
        samples
    }
}

/// A decoded RGB image produced by the synthesis engine.
///
/// `data` is row-major, `height * width * channels` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
    /// Presentation time, seconds since epoch
    pub timestamp: f64,
}

impl VideoFrame {
    /// Create an RGB frame, checking that the buffer matches the dimensions.
    #[cfg(test)]
    pub fn rgb(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self {
            width,
            height,
            channels: 3,
            data,
            timestamp: wall_clock_secs(),
        })
    }

    /// A frame filled with a single color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            channels: 3,
            data,
            timestamp: wall_clock_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_chunk_duration() {
        // 100ms at 16kHz = 1600 samples = 3200 bytes
        let chunk = AudioChunk::silence(3200, 16000);
        assert_eq!(chunk.sample_count(), 1600);
        assert!((chunk.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_samples_are_little_endian() {
        let chunk = AudioChunk::from_samples(&[1, -2, 300], 16000);
        assert_eq!(&chunk.pcm[..2], &[0x01, 0x00]);
        assert_eq!(chunk.samples(), vec![1, -2, 300]);
    }

    #[test]
    fn test_rgb_frame_size_check() {
        assert!(VideoFrame::rgb(2, 2, vec![0; 12]).is_some());
        assert!(VideoFrame::rgb(2, 2, vec![0; 11]).is_none());
        let frame = VideoFrame::solid(4, 3, [10, 20, 30]);
        assert_eq!(frame.data.len(), 36);
        assert_eq!(&frame.data[..3], &[10, 20, 30]);
    }
}
