//! # Frame Codec
//!
//! Serializes outgoing media into the relay's binary wire format.
//!
//! ## Server → Client Frames:
//! ```text
//! video  0x01 | width u16 | height u16 | fps f32 | len u32 | timestamp f64 | JPEG
//! audio  0x02 | rate u32  | channels u8          | len u32 | timestamp f64 | int16 LE PCM
//! marker 0x03
//! ```
//! All header integers and floats are big-endian; the PCM payload stays
//! little-endian exactly as the engine produced it.
//!
//! Everything here is a pure transform: no I/O, no shared state.

use actix_web::web::Bytes;
use byteorder::{BigEndian, WriteBytesExt};
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

use crate::error::{RelayError, RelayResult};
use crate::media::{AudioChunk, VideoFrame};

pub const TAG_VIDEO: u8 = 0x01;
pub const TAG_AUDIO: u8 = 0x02;
pub const TAG_END_OF_SPEECH: u8 = 0x03;

/// tag(1) + width(2) + height(2) + fps(4) + len(4) + timestamp(8)
pub const VIDEO_HEADER_LEN: usize = 21;
/// tag(1) + sample_rate(4) + channels(1) + len(4) + timestamp(8)
pub const AUDIO_HEADER_LEN: usize = 18;

/// Compress a frame to JPEG and prepend the video header.
///
/// `fps` is the measured output rate reported to clients, not the target.
pub fn encode_video(frame: &VideoFrame, fps: f32, quality: u8) -> RelayResult<Bytes> {
    let width = u16::try_from(frame.width)
        .map_err(|_| RelayError::Encode(format!("frame width {} exceeds u16", frame.width)))?;
    let height = u16::try_from(frame.height)
        .map_err(|_| RelayError::Encode(format!("frame height {} exceeds u16", frame.height)))?;

    let jpeg = compress_jpeg(frame, quality)?;
    let payload_len = u32::try_from(jpeg.len())
        .map_err(|_| RelayError::Encode("JPEG payload exceeds u32".to_string()))?;

    let mut out = Vec::with_capacity(VIDEO_HEADER_LEN + jpeg.len());
    out.write_u8(TAG_VIDEO)?;
    out.write_u16::<BigEndian>(width)?;
    out.write_u16::<BigEndian>(height)?;
    out.write_f32::<BigEndian>(fps)?;
    out.write_u32::<BigEndian>(payload_len)?;
    out.write_f64::<BigEndian>(frame.timestamp)?;
    out.extend_from_slice(&jpeg);

    Ok(Bytes::from(out))
}

/// Prepend the audio header to a mono PCM chunk.
pub fn encode_audio(chunk: &AudioChunk) -> RelayResult<Bytes> {
    let payload_len = u32::try_from(chunk.byte_len())
        .map_err(|_| RelayError::Encode("PCM payload exceeds u32".to_string()))?;

    let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + chunk.byte_len());
    out.write_u8(TAG_AUDIO)?;
    out.write_u32::<BigEndian>(chunk.sample_rate)?;
    out.write_u8(1)?; // mono
    out.write_u32::<BigEndian>(payload_len)?;
    out.write_f64::<BigEndian>(chunk.timestamp)?;
    out.extend_from_slice(&chunk.pcm);

    Ok(Bytes::from(out))
}

/// The single-byte end-of-speech marker.
pub fn encode_end_of_speech() -> Bytes {
    Bytes::from_static(&[TAG_END_OF_SPEECH])
}

fn compress_jpeg(frame: &VideoFrame, quality: u8) -> RelayResult<Vec<u8>> {
    let expected = frame.width as usize * frame.height as usize * frame.channels as usize;
    if frame.data.len() != expected {
        return Err(RelayError::Encode(format!(
            "frame buffer is {} bytes, expected {} for {}x{}x{}",
            frame.data.len(),
            expected,
            frame.width,
            frame.height,
            frame.channels
        )));
    }

    let mut jpeg = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
        match frame.channels {
            1 => encoder.encode(&frame.data, frame.width, frame.height, ColorType::L8)?,
            3 => encoder.encode(&frame.data, frame.width, frame.height, ColorType::Rgb8)?,
            4 => {
                // JPEG has no alpha channel
                let rgb: Vec<u8> = frame
                    .data
                    .chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect();
                encoder.encode(&rgb, frame.width, frame.height, ColorType::Rgb8)?
            }
            other => {
                return Err(RelayError::Encode(format!("unsupported channel count {}", other)));
            }
        }
    }

    Ok(jpeg)
}

/// Header of a server frame, parsed back out for assertions in tests.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Video { width: u16, height: u16, fps: f32, payload_len: u32, timestamp: f64 },
    Audio { sample_rate: u32, channels: u8, payload_len: u32, timestamp: f64 },
    EndOfSpeech,
}

#[cfg(test)]
impl ParsedFrame {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        use byteorder::ReadBytesExt;
        use std::io::Cursor;

        let mut cursor = Cursor::new(bytes);
        match cursor.read_u8().ok()? {
            TAG_VIDEO => Some(ParsedFrame::Video {
                width: cursor.read_u16::<BigEndian>().ok()?,
                height: cursor.read_u16::<BigEndian>().ok()?,
                fps: cursor.read_f32::<BigEndian>().ok()?,
                payload_len: cursor.read_u32::<BigEndian>().ok()?,
                timestamp: cursor.read_f64::<BigEndian>().ok()?,
            }),
            TAG_AUDIO => Some(ParsedFrame::Audio {
                sample_rate: cursor.read_u32::<BigEndian>().ok()?,
                channels: cursor.read_u8().ok()?,
                payload_len: cursor.read_u32::<BigEndian>().ok()?,
                timestamp: cursor.read_f64::<BigEndian>().ok()?,
            }),
            TAG_END_OF_SPEECH => Some(ParsedFrame::EndOfSpeech),
            _ => None,
        }
    }
}
