//! Relay-wide counters, updated lock-free from the pumps and connection handlers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RelayStats {
    pub audio_chunks_received: AtomicU64,
    pub audio_chunks_dropped: AtomicU64,
    pub audio_chunks_forwarded: AtomicU64,
    pub stale_chunks_discarded: AtomicU64,
    pub engine_errors: AtomicU64,
    pub flushes_requested: AtomicU64,
    pub flushes_coalesced: AtomicU64,
    pub flushes_completed: AtomicU64,
    pub flush_deadlines_hit: AtomicU64,
    pub interrupts: AtomicU64,
    pub video_frames_sent: AtomicU64,
    pub audio_frames_sent: AtomicU64,
    pub end_markers_sent: AtomicU64,
    pub frames_without_audience: AtomicU64,
    pub stale_frames_discarded: AtomicU64,
    pub encode_errors: AtomicU64,
    pub backlogged_deliveries: AtomicU64,
    pub clients_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`] for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub audio_chunks_received: u64,
    pub audio_chunks_dropped: u64,
    pub audio_chunks_forwarded: u64,
    pub stale_chunks_discarded: u64,
    pub engine_errors: u64,
    pub flushes_requested: u64,
    pub flushes_coalesced: u64,
    pub flushes_completed: u64,
    pub flush_deadlines_hit: u64,
    pub interrupts: u64,
    pub video_frames_sent: u64,
    pub audio_frames_sent: u64,
    pub end_markers_sent: u64,
    pub frames_without_audience: u64,
    pub stale_frames_discarded: u64,
    pub encode_errors: u64,
    pub backlogged_deliveries: u64,
    pub clients_dropped: u64,
    pub bytes_sent: u64,
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, amount: u64) {
    counter.fetch_add(amount, Ordering::Relaxed);
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            audio_chunks_received: load(&self.audio_chunks_received),
            audio_chunks_dropped: load(&self.audio_chunks_dropped),
            audio_chunks_forwarded: load(&self.audio_chunks_forwarded),
            stale_chunks_discarded: load(&self.stale_chunks_discarded),
            engine_errors: load(&self.engine_errors),
            flushes_requested: load(&self.flushes_requested),
            flushes_coalesced: load(&self.flushes_coalesced),
            flushes_completed: load(&self.flushes_completed),
            flush_deadlines_hit: load(&self.flush_deadlines_hit),
            interrupts: load(&self.interrupts),
            video_frames_sent: load(&self.video_frames_sent),
            audio_frames_sent: load(&self.audio_frames_sent),
            end_markers_sent: load(&self.end_markers_sent),
            frames_without_audience: load(&self.frames_without_audience),
            stale_frames_discarded: load(&self.stale_frames_discarded),
            encode_errors: load(&self.encode_errors),
            backlogged_deliveries: load(&self.backlogged_deliveries),
            clients_dropped: load(&self.clients_dropped),
            bytes_sent: load(&self.bytes_sent),
        }
    }
}
