//! # Loopback Engine
//!
//! A built-in [`AvatarEngine`] that needs no model: pushed audio is echoed
//! back in frame-sized slices, each paired with a generated image whose
//! "mouth" opens with the loudness of that slice.
//!
//! It honours the full engine contract (segments, flush, interrupt,
//! end-of-speech) so the relay can be run and tested end to end without a
//! real renderer behind it.
//!
//! ## Output Rules (per pull):
//! 1. At least one frame's worth of samples buffered → image + that audio
//! 2. Segment closed (`last_chunk`) with a short remainder → image + padded remainder
//! 3. Flushed and drained → one end-of-speech frame
//! 4. Otherwise → idle image only

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_web::web::Bytes;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{AvatarEngine, EngineFrame, FrameStream};
use crate::config::AppConfig;
use crate::error::{RelayError, RelayResult};
use crate::media::{AudioChunk, VideoFrame};

const BACKGROUND: [u8; 3] = [28, 36, 52];
const FACE: [u8; 3] = [214, 170, 140];
const MOUTH: [u8; 3] = [96, 24, 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct Segment {
    pending: VecDeque<i16>,
    /// `last_chunk` seen: emit the remainder even if it is short
    closed: bool,
    /// `flush` seen: emit end-of-speech once drained
    flushed: bool,
}

struct LoopbackInner {
    width: u32,
    height: u32,
    sample_rate: u32,
    samples_per_frame: usize,
    segment: Mutex<Segment>,
    phase: watch::Sender<Phase>,
}

pub struct LoopbackEngine {
    inner: Arc<LoopbackInner>,
    frames_taken: AtomicBool,
}

impl LoopbackEngine {
    pub fn new(width: u32, height: u32, fps: f64, sample_rate: u32) -> Self {
        let samples_per_frame = ((sample_rate as f64 / fps.max(1.0)).round() as usize).max(1);
        let (phase, _) = watch::channel(Phase::Created);
        Self {
            inner: Arc::new(LoopbackInner {
                width,
                height,
                sample_rate,
                samples_per_frame,
                segment: Mutex::new(Segment::default()),
                phase,
            }),
            frames_taken: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.video.frame_width,
            config.video.frame_height,
            config.video.target_fps,
            config.audio.sample_rate,
        )
    }

    /// Samples buffered for the current segment.
    #[cfg(test)]
    pub fn pending_samples(&self) -> usize {
        self.inner.segment.lock().pending.len()
    }
}

impl LoopbackInner {
    fn next_frame(&self) -> EngineFrame {
        let mut segment = self.segment.lock();

        let audio = if segment.pending.len() >= self.samples_per_frame {
            let samples: Vec<i16> = segment.pending.drain(..self.samples_per_frame).collect();
            Some(samples)
        } else if segment.closed && !segment.pending.is_empty() {
            let mut samples: Vec<i16> = segment.pending.drain(..).collect();
            samples.resize(self.samples_per_frame, 0);
            Some(samples)
        } else {
            None
        };

        if segment.flushed && segment.pending.is_empty() && audio.is_none() {
            *segment = Segment::default();
            return EngineFrame {
                image: None,
                audio: None,
                end_of_speech: true,
            };
        }
        if segment.closed && segment.pending.is_empty() && !segment.flushed {
            segment.closed = false;
        }
        drop(segment);

        let level = audio.as_deref().map(rms_level).unwrap_or(0.0);
        EngineFrame {
            image: Some(self.render(level)),
            audio: audio.map(|samples| AudioChunk::from_samples(&samples, self.sample_rate)),
            end_of_speech: false,
        }
    }

    /// Draw a face whose mouth height follows `level` (0.0..=1.0).
    fn render(&self, level: f32) -> VideoFrame {
        let mut frame = VideoFrame::solid(self.width, self.height, BACKGROUND);
        let (w, h) = (self.width as usize, self.height as usize);

        let face = (w / 4, h / 6, w * 3 / 4, h * 5 / 6);
        let mouth_half = ((h / 12) as f32 * level.clamp(0.0, 1.0)) as usize;
        let mouth = (w * 3 / 8, h * 2 / 3 - mouth_half, w * 5 / 8, h * 2 / 3 + mouth_half + 1);

        for y in 0..h {
            for x in 0..w {
                let inside = |r: (usize, usize, usize, usize)| x >= r.0 && x < r.2 && y >= r.1 && y < r.3;
                let color = if inside(mouth) {
                    MOUTH
                } else if inside(face) {
                    FACE
                } else {
                    continue;
                };
                let offset = (y * w + x) * 3;
                frame.data[offset..offset + 3].copy_from_slice(&color);
            }
        }
        frame
    }
}

fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum / samples.len() as f64).sqrt();
    // Normal speech sits well below full scale
    ((rms / 8192.0) as f32).min(1.0)
}

#[async_trait]
impl AvatarEngine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn start(&self) -> RelayResult<()> {
        info!(
            width = self.inner.width,
            height = self.inner.height,
            samples_per_frame = self.inner.samples_per_frame,
            "Loopback engine started"
        );
        self.inner.phase.send_replace(Phase::Running);
        Ok(())
    }

    async fn stop(&self) -> RelayResult<()> {
        self.inner.phase.send_replace(Phase::Stopped);
        *self.inner.segment.lock() = Segment::default();
        info!("Loopback engine stopped");
        Ok(())
    }

    async fn push_audio(&self, pcm: Bytes, sample_rate: u32, last_chunk: bool) -> RelayResult<()> {
        if sample_rate != self.inner.sample_rate {
            return Err(RelayError::Engine(format!(
                "unsupported sample rate {} (engine runs at {})",
                sample_rate, self.inner.sample_rate
            )));
        }
        if pcm.len() % 2 != 0 {
            return Err(RelayError::Engine(format!("odd PCM length {}", pcm.len())));
        }

        let mut samples = vec![0i16; pcm.len() / 2];
        LittleEndian::read_i16_into(&pcm, &mut samples);

        let mut segment = self.inner.segment.lock();
        segment.pending.extend(samples);
        if last_chunk {
            segment.closed = true;
        }
        Ok(())
    }

    async fn flush(&self) -> RelayResult<()> {
        let mut segment = self.inner.segment.lock();
        segment.closed = true;
        segment.flushed = true;
        debug!(pending = segment.pending.len(), "Loopback flush");
        Ok(())
    }

    async fn interrupt(&self) -> RelayResult<()> {
        let mut segment = self.inner.segment.lock();
        let discarded = segment.pending.len();
        *segment = Segment::default();
        debug!(discarded, "Loopback interrupt");
        Ok(())
    }

    fn frames(&self) -> RelayResult<FrameStream> {
        if self.frames_taken.swap(true, Ordering::SeqCst) {
            return Err(RelayError::Engine("frame stream already taken".to_string()));
        }

        let inner = Arc::clone(&self.inner);
        let phase = inner.phase.subscribe();

        let frames = stream::unfold((inner, phase), |(inner, mut phase)| async move {
            loop {
                let current = *phase.borrow_and_update();
                match current {
                    Phase::Running => break,
                    Phase::Stopped => return None,
                    Phase::Created => {
                        if phase.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
            let frame = inner.next_frame();
            Some((frame, (inner, phase)))
        });

        Ok(frames.boxed())
    }
}
