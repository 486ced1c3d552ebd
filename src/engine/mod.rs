//! # Avatar Synthesis Engine
//!
//! The relay treats the synthesis engine as a black box behind the
//! [`AvatarEngine`] trait: audio goes in, paired video frames and audio come
//! out, and the relay never looks at how they are produced.
//!
//! ## Engine Contract:
//! - **start/stop**: bring the engine up before any other call, tear it down last
//! - **push_audio**: append int16 PCM to the current segment; `last_chunk` closes it
//! - **flush**: finalize whatever is buffered for the current segment
//! - **interrupt**: drop everything in flight, including buffered output
//! - **frames**: the output stream, pulled by exactly one consumer
//!
//! Output timing is the relay's job, not the engine's: a frame is produced
//! whenever the stream is polled, and the render pump decides when to poll.

pub mod loopback;

use async_trait::async_trait;
use actix_web::web::Bytes;
use futures_util::stream::BoxStream;

use crate::error::RelayResult;
use crate::media::{AudioChunk, VideoFrame};

pub use loopback::LoopbackEngine;

/// One unit of engine output.
///
/// A frame can carry any combination of an image, the audio produced
/// alongside it, and the end-of-speech flag. An idle engine still produces
/// image-only frames so clients keep seeing the avatar.
#[derive(Debug, Clone, Default)]
pub struct EngineFrame {
    pub image: Option<VideoFrame>,
    pub audio: Option<AudioChunk>,
    /// The segment that was flushed has been fully rendered
    pub end_of_speech: bool,
}

/// Output stream of an engine, owned by the render pump.
pub type FrameStream = BoxStream<'static, EngineFrame>;

/// Interface to a speech-driven avatar renderer.
///
/// Implementations must be safe to call from the inbound pump and the
/// render pump concurrently.
#[async_trait]
pub trait AvatarEngine: Send + Sync {
    /// Human-readable engine name for logs and health output.
    fn name(&self) -> &str;

    async fn start(&self) -> RelayResult<()>;

    async fn stop(&self) -> RelayResult<()>;

    async fn push_audio(&self, pcm: Bytes, sample_rate: u32, last_chunk: bool) -> RelayResult<()>;

    async fn flush(&self) -> RelayResult<()>;

    async fn interrupt(&self) -> RelayResult<()>;

    /// Take the output stream. Can only be taken once.
    fn frames(&self) -> RelayResult<FrameStream>;
}

#[cfg(test)]
pub mod testing {
    //! Scripted engine for driving the pumps in tests.

    use super::*;
    use crate::error::RelayError;
    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Debug, Clone, PartialEq)]
    pub enum EngineCall {
        Push { bytes: usize, last_chunk: bool },
        Flush,
        Interrupt,
    }

    /// Records every call; frames are whatever the test sends into `feed`.
    pub struct ScriptedEngine {
        pub calls: Mutex<Vec<EngineCall>>,
        /// Payloads of accepted pushes, in arrival order
        pub pushed: Mutex<Vec<Bytes>>,
        pub fail_pushes: Mutex<bool>,
        feed: mpsc::UnboundedSender<EngineFrame>,
        output: Mutex<Option<mpsc::UnboundedReceiver<EngineFrame>>>,
    }

    impl ScriptedEngine {
        pub fn new() -> Self {
            let (feed, output) = mpsc::unbounded_channel();
            Self {
                calls: Mutex::new(Vec::new()),
                pushed: Mutex::new(Vec::new()),
                fail_pushes: Mutex::new(false),
                feed,
                output: Mutex::new(Some(output)),
            }
        }

        pub fn emit(&self, frame: EngineFrame) {
            let _ = self.feed.send(frame);
        }

        pub fn calls(&self) -> Vec<EngineCall> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl AvatarEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&self) -> RelayResult<()> {
            Ok(())
        }

        async fn stop(&self) -> RelayResult<()> {
            Ok(())
        }

        async fn push_audio(&self, pcm: Bytes, _sample_rate: u32, last_chunk: bool) -> RelayResult<()> {
            if *self.fail_pushes.lock() {
                return Err(RelayError::Engine("scripted failure".to_string()));
            }
            self.calls.lock().push(EngineCall::Push {
                bytes: pcm.len(),
                last_chunk,
            });
            self.pushed.lock().push(pcm);
            Ok(())
        }

        async fn flush(&self) -> RelayResult<()> {
            self.calls.lock().push(EngineCall::Flush);
            Ok(())
        }

        async fn interrupt(&self) -> RelayResult<()> {
            self.calls.lock().push(EngineCall::Interrupt);
            Ok(())
        }

        fn frames(&self) -> RelayResult<FrameStream> {
            let output = self
                .output
                .lock()
                .take()
                .ok_or_else(|| RelayError::Engine("frame stream already taken".to_string()))?;
            Ok(UnboundedReceiverStream::new(output).boxed())
        }
    }
}
