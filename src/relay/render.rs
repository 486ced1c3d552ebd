//! # Render Pump
//!
//! Pulls frames from the engine, paces them to the target frame rate and
//! fans them out to subscribers.
//!
//! ## Per Frame:
//! 1. Pull the next engine frame and note the applied interrupt epoch
//! 2. Frames with an image wait for their pacing slot
//! 3. Drop the frame if an interrupt landed since it was pulled
//! 4. Count its audio toward flush completion
//! 5. Nobody connected: skip encoding, pacing still advances
//! 6. Video to video subscribers, audio to audio subscribers, the
//!    end-of-speech marker to everyone
//!
//! JPEG compression runs on the blocking pool so a large frame never stalls
//! the runtime.

use std::sync::Arc;

use actix_web::web::Bytes;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::control::ControlPlane;
use super::pacing::FrameRateController;
use super::registry::{MediaKind, SessionRegistry};
use super::stats::{self, RelayStats};
use crate::config::VideoConfig;
use crate::engine::{EngineFrame, FrameStream};
use crate::error::RelayError;
use crate::media::VideoFrame;
use crate::protocol::{encode_audio, encode_end_of_speech, encode_video};

pub struct RenderPump {
    frames: FrameStream,
    registry: Arc<SessionRegistry>,
    control: Arc<ControlPlane>,
    stats: Arc<RelayStats>,
    video: VideoConfig,
    pacer: FrameRateController,
}

impl RenderPump {
    pub fn new(
        frames: FrameStream,
        registry: Arc<SessionRegistry>,
        control: Arc<ControlPlane>,
        stats: Arc<RelayStats>,
        video: VideoConfig,
    ) -> Self {
        let pacer = FrameRateController::new(video.target_fps);
        Self {
            frames,
            registry,
            control,
            stats,
            video,
            pacer,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(target_fps = self.pacer.target_fps(), "Render pump started");
        loop {
            // Read before polling: a frame awaited across an interrupt
            // being applied counts as old output
            let pulled_at = self.control.applied_epoch();
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.frames.next() => match next {
                    Some(frame) => frame,
                    None => {
                        warn!("Engine frame stream ended");
                        break;
                    }
                },
            };

            if frame.image.is_some() {
                let wait = self.pacer.time_until_next_frame();
                if !wait.is_zero() {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                self.pacer.update();
            }

            self.dispatch(frame, pulled_at).await;
        }
        info!("Render pump stopped");
    }

    async fn dispatch(&mut self, frame: EngineFrame, pulled_at: u64) {
        if !self.control.output_is_current(pulled_at) {
            stats::bump(&self.stats.stale_frames_discarded);
            return;
        }

        if let Some(audio) = &frame.audio {
            self.control.record_emitted(audio.duration_secs());
        }

        if self.registry.is_empty() {
            stats::bump(&self.stats.frames_without_audience);
            return;
        }

        if let Some(image) = frame.image {
            if self.registry.has_subscribers(MediaKind::Video) {
                let fps = self.pacer.average_fps() as f32;
                match encode_off_runtime(image, fps, self.video.jpeg_quality).await {
                    Ok(payload) if self.control.output_is_current(pulled_at) => {
                        self.send(MediaKind::Video, payload);
                        stats::bump(&self.stats.video_frames_sent);
                    }
                    Ok(_) => stats::bump(&self.stats.stale_frames_discarded),
                    Err(err) => {
                        warn!(error = %err, "Skipping video frame");
                        stats::bump(&self.stats.encode_errors);
                    }
                }
            }
        }

        if let Some(audio) = frame.audio {
            if self.registry.has_subscribers(MediaKind::Audio) {
                match encode_audio(&audio) {
                    Ok(payload) => {
                        self.send(MediaKind::Audio, payload);
                        stats::bump(&self.stats.audio_frames_sent);
                    }
                    Err(err) => {
                        warn!(error = %err, "Skipping audio frame");
                        stats::bump(&self.stats.encode_errors);
                    }
                }
            }
        }

        if frame.end_of_speech && self.control.output_is_current(pulled_at) {
            self.send(MediaKind::Marker, encode_end_of_speech());
            stats::bump(&self.stats.end_markers_sent);
            debug!("End of speech sent");
        }
    }

    fn send(&self, kind: MediaKind, payload: Bytes) {
        let size = payload.len() as u64;
        let report = self.registry.broadcast(kind, payload);
        stats::add(&self.stats.bytes_sent, size * report.delivered as u64);
        stats::add(&self.stats.backlogged_deliveries, report.backlogged as u64);
        stats::add(&self.stats.clients_dropped, report.removed as u64);
    }
}

async fn encode_off_runtime(image: VideoFrame, fps: f32, quality: u8) -> Result<Bytes, RelayError> {
    match tokio::task::spawn_blocking(move || encode_video(&image, fps, quality)).await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "JPEG encoder task failed");
            Err(RelayError::Internal(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::testing::ScriptedEngine;
    use crate::engine::AvatarEngine;
    use crate::media::AudioChunk;
    use crate::protocol::codec::{ParsedFrame, TAG_AUDIO, TAG_VIDEO};
    use crate::relay::queue::InboundQueue;
    use crate::relay::registry::testing::RecordingTransport;
    use crate::relay::registry::Outbound;
    use std::time::Duration;

    struct Harness {
        engine: Arc<ScriptedEngine>,
        registry: Arc<SessionRegistry>,
        control: Arc<ControlPlane>,
        stats: Arc<RelayStats>,
        _shutdown: watch::Sender<bool>,
    }

    fn start() -> Harness {
        let config = AppConfig::default();
        let engine = Arc::new(ScriptedEngine::new());
        let stats = Arc::new(RelayStats::default());
        let registry = Arc::new(SessionRegistry::new(4));
        let control = Arc::new(ControlPlane::new(
            Arc::new(InboundQueue::new(100, 1 << 20)),
            engine.clone(),
            config.flush.clone(),
            16000,
            Arc::clone(&stats),
        ));
        let pump = RenderPump::new(
            engine.frames().unwrap(),
            Arc::clone(&registry),
            Arc::clone(&control),
            Arc::clone(&stats),
            config.video,
        );
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(pump.run(rx));
        Harness {
            engine,
            registry,
            control,
            stats,
            _shutdown: shutdown,
        }
    }

    fn connect(h: &Harness, id: &str) -> Arc<RecordingTransport> {
        let transport = Arc::new(RecordingTransport::default());
        h.registry.register(id.to_string(), transport.clone()).unwrap();
        transport
    }

    fn talking_frame() -> EngineFrame {
        EngineFrame {
            image: Some(VideoFrame::solid(16, 16, [255, 0, 0])),
            audio: Some(AudioChunk::silence(1280, 16000)),
            end_of_speech: false,
        }
    }

    fn marker_frame() -> EngineFrame {
        EngineFrame {
            end_of_speech: true,
            ..EngineFrame::default()
        }
    }

    fn payload_tags(transport: &RecordingTransport) -> Vec<u8> {
        transport
            .delivered
            .lock()
            .iter()
            .filter_map(|message| match message {
                Outbound::Media { payload, .. } => payload.first().copied(),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_frames_fan_out_by_subscription() {
        let h = start();
        let a = connect(&h, "a");
        let b = connect(&h, "b");
        h.registry.update_subscription("b", Some(false), None);

        h.engine.emit(talking_frame());
        h.engine.emit(marker_frame());
        settle().await;

        assert_eq!(payload_tags(&a), vec![TAG_VIDEO, TAG_AUDIO, 0x03]);
        assert_eq!(payload_tags(&b), vec![TAG_AUDIO, 0x03]);
    }

    #[tokio::test]
    async fn test_video_header_reports_fps() {
        let h = start();
        let a = connect(&h, "a");
        h.engine.emit(talking_frame());
        settle().await;

        let delivered = a.delivered.lock();
        let video = delivered.iter().find_map(|message| match message {
            Outbound::Media {
                kind: MediaKind::Video,
                payload,
            } => ParsedFrame::parse(payload),
            _ => None,
        });
        assert!(matches!(
            video,
            Some(ParsedFrame::Video { width: 16, height: 16, fps, .. }) if fps > 0.0
        ));
    }

    #[tokio::test]
    async fn test_no_clients_still_counts_emitted_audio() {
        let h = start();
        h.engine.emit(talking_frame());
        settle().await;

        assert_eq!(h.stats.snapshot().frames_without_audience, 1);
        assert!((h.control.snapshot().emitted_secs - 0.04).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_frames_pulled_before_interrupt_applied_are_dropped() {
        let h = start();
        let a = connect(&h, "a");

        // Requested but not yet applied by the inbound pump
        h.control.interrupt();
        h.engine.emit(talking_frame());
        h.engine.emit(marker_frame());
        settle().await;
        assert!(payload_tags(&a).is_empty());
        assert_eq!(h.stats.snapshot().stale_frames_discarded, 2);

        // The pump was already waiting under the old epoch, so the first
        // frame after the interrupt is applied is dropped as well
        h.control.mark_interrupt_applied(1);
        h.engine.emit(talking_frame());
        settle().await;
        assert!(payload_tags(&a).is_empty());
        assert_eq!(h.stats.snapshot().stale_frames_discarded, 3);

        h.engine.emit(talking_frame());
        settle().await;
        assert_eq!(payload_tags(&a), vec![TAG_VIDEO, TAG_AUDIO]);
    }

    #[tokio::test]
    async fn test_disconnected_client_is_removed() {
        let h = start();
        let a = connect(&h, "a");
        let _b = connect(&h, "b");
        a.fail_with(crate::relay::registry::DeliveryError::Disconnected);

        h.engine.emit(marker_frame());
        settle().await;

        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.stats.snapshot().clients_dropped, 1);
        assert_eq!(h.stats.snapshot().end_markers_sent, 1);
    }
}
