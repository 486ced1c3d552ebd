//! # Inbound Queue
//!
//! Bounded FIFO between the connection handlers (producers) and the inbound
//! pump (single consumer).
//!
//! ## Key Features:
//! - **Ordering**: audio and control items leave in the order they arrived
//! - **Drop-oldest**: when the audio limits are hit, the oldest audio chunks
//!   are discarded so the relay stays near real time; control items are never dropped
//! - **Interrupt purge**: pending audio and end-of-segment items are removed and
//!   the interrupt jumps to the head of the queue
//!
//! Producers never block. The consumer waits on a [`Notify`] when the queue is empty.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::registry::SessionId;
use crate::media::AudioChunk;

/// Audio tagged with the session that sent it and the interrupt epoch it belongs to.
#[derive(Debug, Clone)]
pub struct SubmittedAudio {
    pub session_id: SessionId,
    pub chunk: AudioChunk,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub enum InboundItem {
    Audio(SubmittedAudio),
    /// The client finished the current segment
    EndOfSegment,
    /// Cancel everything older than `epoch`
    Interrupt { epoch: u64 },
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<InboundItem>,
    audio_chunks: usize,
    audio_bytes: usize,
}

impl QueueState {
    /// Remove the oldest audio item, leaving control items in place.
    fn evict_oldest_audio(&mut self) -> bool {
        let position = self
            .items
            .iter()
            .position(|item| matches!(item, InboundItem::Audio(_)));
        match position.and_then(|index| self.items.remove(index)) {
            Some(InboundItem::Audio(audio)) => {
                self.audio_chunks -= 1;
                self.audio_bytes -= audio.chunk.byte_len();
                true
            }
            _ => false,
        }
    }
}

pub struct InboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_chunks: usize,
    max_bytes: usize,
}

impl InboundQueue {
    pub fn new(max_chunks: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_chunks: max_chunks.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Enqueue audio, returning how many chunks were dropped to make room.
    ///
    /// A chunk larger than the whole byte budget is itself dropped.
    pub fn push_audio(&self, audio: SubmittedAudio) -> usize {
        let size = audio.chunk.byte_len();
        if size > self.max_bytes {
            return 1;
        }

        let mut dropped = 0;
        {
            let mut state = self.state.lock();
            while state.audio_chunks + 1 > self.max_chunks || state.audio_bytes + size > self.max_bytes {
                if !state.evict_oldest_audio() {
                    break;
                }
                dropped += 1;
            }
            state.audio_chunks += 1;
            state.audio_bytes += size;
            state.items.push_back(InboundItem::Audio(audio));
        }

        self.notify.notify_one();
        dropped
    }

    pub fn push_end(&self) {
        self.state.lock().items.push_back(InboundItem::EndOfSegment);
        self.notify.notify_one();
    }

    /// Drop queued audio and end-of-segment items and put the interrupt first.
    ///
    /// Returns the number of items purged.
    pub fn interrupt(&self, epoch: u64) -> usize {
        let purged = {
            let mut state = self.state.lock();
            let before = state.items.len();
            // An earlier interrupt still waiting is subsumed by this one
            state.items.clear();
            state.audio_chunks = 0;
            state.audio_bytes = 0;
            state.items.push_front(InboundItem::Interrupt { epoch });
            before
        };

        self.notify.notify_one();
        purged
    }

    /// Wait for the next item.
    pub async fn pop(&self) -> InboundItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<InboundItem> {
        let mut state = self.state.lock();
        let item = state.items.pop_front()?;
        if let InboundItem::Audio(audio) = &item {
            state.audio_chunks -= 1;
            state.audio_bytes -= audio.chunk.byte_len();
        }
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued audio as (chunks, bytes).
    pub fn audio_backlog(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.audio_chunks, state.audio_bytes)
    }
}
