//! # Segment Control Plane
//!
//! Owns the per-relay segment lifecycle and the interrupt epoch. Connection
//! handlers call in here for every audio chunk and control command; the
//! pumps call in to report what the engine has taken and produced.
//!
//! ## Segment States:
//! ```text
//! Idle --audio--> Receiving --end--> Flushing --drained/deadline--> Idle
//!   ^                                   |      (Receiving if audio arrived meanwhile)
//!   +--------------- interrupt ---------+  (from any state)
//! ```
//!
//! ## Interrupt Epochs:
//! `interrupt` bumps `requested_epoch` immediately. Audio is tagged with the
//! epoch it was submitted under, so anything older is discarded before it
//! reaches the engine. Once the inbound pump has forwarded the interrupt it
//! raises `applied_epoch`; the render pump drops every frame pulled while the
//! two differ.
//!
//! ## Flush Completion:
//! The engine gives no "done" signal, so completion is inferred: the flush
//! waits until the emitted audio duration reaches `completion_ratio` of the
//! pushed duration, or a deadline derived from the pending audio passes.
//! Audio the engine takes after the trailing silence belongs to the next
//! segment and is metered separately until the flush finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::queue::{InboundQueue, SubmittedAudio};
use super::stats::{self, RelayStats};
use crate::config::FlushConfig;
use crate::engine::AvatarEngine;
use crate::media::AudioChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Idle,
    Receiving,
    Flushing,
}

#[derive(Debug)]
struct ControlState {
    segment: SegmentState,
    /// Seconds of audio handed to the engine this segment
    pushed_secs: f64,
    /// Seconds of audio the engine has emitted this segment
    emitted_secs: f64,
    /// Seconds of next-segment audio handed to the engine during a flush wait
    next_pushed_secs: f64,
    /// Trailing silence is pushed; further pushes belong to the next segment
    draining: bool,
    /// Audio submitted while a flush was running
    audio_during_flush: bool,
    /// An `end` arrived for that new audio before the flush finished
    deferred_end: bool,
    flush_task: Option<JoinHandle<()>>,
}

impl ControlState {
    fn reset_meters(&mut self) {
        self.pushed_secs = 0.0;
        self.emitted_secs = 0.0;
        self.next_pushed_secs = 0.0;
        self.draining = false;
    }

    /// Close the drained segment's meters and open the next segment's.
    ///
    /// The engine emits in push order, so output beyond the closed segment's
    /// pushed audio already belongs to the next one.
    fn roll_meters(&mut self) {
        self.emitted_secs = (self.emitted_secs - self.pushed_secs).max(0.0);
        self.pushed_secs = self.next_pushed_secs;
        self.next_pushed_secs = 0.0;
        self.draining = false;
    }
}

/// Snapshot for health and stats output.
#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    pub segment: SegmentState,
    pub requested_epoch: u64,
    pub applied_epoch: u64,
    pub pushed_secs: f64,
    pub emitted_secs: f64,
}

pub struct ControlPlane {
    state: Mutex<ControlState>,
    requested_epoch: AtomicU64,
    applied_epoch: AtomicU64,
    queue: Arc<InboundQueue>,
    engine: Arc<dyn AvatarEngine>,
    flush: FlushConfig,
    sample_rate: u32,
    stats: Arc<RelayStats>,
}

impl ControlPlane {
    pub fn new(
        queue: Arc<InboundQueue>,
        engine: Arc<dyn AvatarEngine>,
        flush: FlushConfig,
        sample_rate: u32,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            state: Mutex::new(ControlState {
                segment: SegmentState::Idle,
                pushed_secs: 0.0,
                emitted_secs: 0.0,
                next_pushed_secs: 0.0,
                draining: false,
                audio_during_flush: false,
                deferred_end: false,
                flush_task: None,
            }),
            requested_epoch: AtomicU64::new(0),
            applied_epoch: AtomicU64::new(0),
            queue,
            engine,
            flush,
            sample_rate,
            stats,
        }
    }

    /// Queue a client's audio chunk for the engine.
    ///
    /// Returns the number of older chunks dropped to make room.
    pub fn submit_audio(&self, session_id: &str, chunk: AudioChunk) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            match state.segment {
                SegmentState::Idle => state.segment = SegmentState::Receiving,
                SegmentState::Flushing => state.audio_during_flush = true,
                SegmentState::Receiving => {}
            }

            // Pushed under the state lock so an interrupt can't slip between
            // reading the epoch and enqueueing
            self.queue.push_audio(SubmittedAudio {
                session_id: session_id.to_string(),
                chunk,
                epoch: self.requested_epoch.load(Ordering::SeqCst),
            })
        };

        stats::bump(&self.stats.audio_chunks_received);
        if dropped > 0 {
            stats::add(&self.stats.audio_chunks_dropped, dropped as u64);
            warn!(session_id = %session_id, dropped, "Inbound audio queue full, dropped oldest chunks");
        }
        dropped
    }

    /// Close the current segment.
    ///
    /// Returns `false` when the request was coalesced into a flush already running.
    pub fn request_flush(&self) -> bool {
        stats::bump(&self.stats.flushes_requested);
        let mut state = self.state.lock();

        if state.segment == SegmentState::Flushing {
            if state.audio_during_flush {
                // The new segment gets its own flush once this one finishes
                state.deferred_end = true;
            }
            stats::bump(&self.stats.flushes_coalesced);
            debug!("Flush already in progress, end request coalesced");
            return false;
        }

        let from = state.segment;
        state.segment = SegmentState::Flushing;
        state.audio_during_flush = false;
        state.deferred_end = false;
        self.queue.push_end();
        info!(?from, "Segment flush requested");
        true
    }

    /// Cancel the current segment. Valid in any state.
    ///
    /// Returns the new epoch.
    pub fn interrupt(&self) -> u64 {
        let (epoch, purged) = {
            let mut state = self.state.lock();
            let epoch = self.requested_epoch.fetch_add(1, Ordering::SeqCst) + 1;

            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
            state.segment = SegmentState::Idle;
            state.audio_during_flush = false;
            state.deferred_end = false;
            state.reset_meters();

            (epoch, self.queue.interrupt(epoch))
        };

        stats::bump(&self.stats.interrupts);
        info!(epoch, purged, "Interrupt requested");
        epoch
    }

    /// Send the trailing silence and start waiting for the engine to drain.
    ///
    /// Called by the inbound pump when it reaches an end-of-segment item.
    pub async fn begin_flush(self: &Arc<Self>) {
        let epoch = self.requested_epoch();
        if self.segment_state() != SegmentState::Flushing {
            debug!("Segment no longer flushing, skipping flush");
            return;
        }

        let silence = AudioChunk::silence(self.flush.trailing_silence_bytes, self.sample_rate);
        match self
            .engine
            .push_audio(silence.pcm.clone(), self.sample_rate, true)
            .await
        {
            Ok(()) => self.record_pushed(silence.duration_secs(), epoch),
            Err(err) => {
                error!(error = %err, "Failed to push trailing silence");
                stats::bump(&self.stats.engine_errors);
            }
        }

        let pending = {
            let mut state = self.state.lock();
            if self.requested_epoch() == epoch {
                state.draining = true;
            }
            (state.pushed_secs - state.emitted_secs).max(0.0)
        };
        let deadline = self.flush.deadline_for(pending);
        debug!(pending_secs = pending, deadline_ms = deadline.as_millis() as u64, "Waiting for engine to drain");

        let control = Arc::clone(self);
        let task = tokio::spawn(async move { control.await_drain(epoch, deadline).await });

        let mut state = self.state.lock();
        if self.requested_epoch() == epoch && state.segment == SegmentState::Flushing {
            state.flush_task = Some(task);
        } else {
            task.abort();
        }
    }

    async fn await_drain(&self, epoch: u64, deadline: Duration) {
        let started = Instant::now();
        let mut deadline_hit = false;

        loop {
            if self.requested_epoch() != epoch {
                return;
            }
            if self.completion_ratio() >= self.flush.completion_ratio {
                break;
            }
            if started.elapsed() >= deadline {
                deadline_hit = true;
                break;
            }
            tokio::time::sleep(self.flush.poll_interval()).await;
        }

        if deadline_hit {
            stats::bump(&self.stats.flush_deadlines_hit);
            warn!(
                ratio = self.completion_ratio(),
                waited_ms = started.elapsed().as_millis() as u64,
                "Flush deadline reached before engine drained"
            );
        }

        if let Err(err) = self.engine.flush().await {
            error!(error = %err, "Engine flush failed");
            stats::bump(&self.stats.engine_errors);
        }
        self.finish_flush(epoch);
    }

    fn finish_flush(&self, epoch: u64) {
        let mut state = self.state.lock();
        if self.requested_epoch() != epoch || state.segment != SegmentState::Flushing {
            return;
        }

        state.flush_task = None;
        state.roll_meters();
        stats::bump(&self.stats.flushes_completed);

        if state.deferred_end {
            state.deferred_end = false;
            state.audio_during_flush = false;
            self.queue.push_end();
            info!("Flush complete, flushing the segment that arrived meanwhile");
        } else if state.audio_during_flush {
            state.audio_during_flush = false;
            state.segment = SegmentState::Receiving;
            info!("Flush complete, next segment already receiving");
        } else {
            state.segment = SegmentState::Idle;
            info!("Flush complete");
        }
    }

    /// Emitted / pushed audio for the current segment; 1.0 when nothing was pushed.
    ///
    /// During a flush wait this is the segment being flushed.
    pub fn completion_ratio(&self) -> f64 {
        let state = self.state.lock();
        if state.pushed_secs <= 0.0 {
            return 1.0;
        }
        state.emitted_secs / state.pushed_secs
    }

    /// Count audio the engine accepted, unless an interrupt made it stale.
    pub fn record_pushed(&self, secs: f64, epoch: u64) {
        let mut state = self.state.lock();
        if self.requested_epoch() != epoch {
            return;
        }
        if state.draining {
            state.next_pushed_secs += secs;
        } else {
            state.pushed_secs += secs;
        }
    }

    pub fn record_emitted(&self, secs: f64) {
        self.state.lock().emitted_secs += secs;
    }

    pub fn mark_interrupt_applied(&self, epoch: u64) {
        self.applied_epoch.fetch_max(epoch, Ordering::SeqCst);
    }

    pub fn requested_epoch(&self) -> u64 {
        self.requested_epoch.load(Ordering::SeqCst)
    }

    pub fn applied_epoch(&self) -> u64 {
        self.applied_epoch.load(Ordering::SeqCst)
    }

    /// Whether output pulled while `applied` was the applied epoch may still be sent.
    pub fn output_is_current(&self, applied: u64) -> bool {
        applied == self.requested_epoch()
    }

    pub fn segment_state(&self) -> SegmentState {
        self.state.lock().segment
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let state = self.state.lock();
        ControlSnapshot {
            segment: state.segment,
            requested_epoch: self.requested_epoch(),
            applied_epoch: self.applied_epoch(),
            pushed_secs: state.pushed_secs,
            emitted_secs: state.emitted_secs,
        }
    }

    /// Abort a running flush wait; used on shutdown.
    pub fn cancel_pending_flush(&self) {
        if let Some(task) = self.state.lock().flush_task.take() {
            task.abort();
        }
    }
}
