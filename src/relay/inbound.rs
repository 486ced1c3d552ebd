//! # Inbound Audio Pump
//!
//! Single consumer of the [`InboundQueue`]: forwards audio to the engine in
//! arrival order and turns end-of-segment and interrupt items into engine
//! calls.
//!
//! Engine failures are logged and counted; the pump keeps going. It only
//! exits on shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::control::ControlPlane;
use super::queue::{InboundItem, InboundQueue, SubmittedAudio};
use super::stats::{self, RelayStats};
use crate::engine::AvatarEngine;

pub struct InboundPump {
    queue: Arc<InboundQueue>,
    engine: Arc<dyn AvatarEngine>,
    control: Arc<ControlPlane>,
    stats: Arc<RelayStats>,
}

impl InboundPump {
    pub fn new(
        queue: Arc<InboundQueue>,
        engine: Arc<dyn AvatarEngine>,
        control: Arc<ControlPlane>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            queue,
            engine,
            control,
            stats,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Inbound pump started");
        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => break,
                item = self.queue.pop() => item,
            };
            self.handle(item).await;
        }
        info!("Inbound pump stopped");
    }

    async fn handle(&self, item: InboundItem) {
        match item {
            InboundItem::Audio(audio) => self.forward_audio(audio).await,
            InboundItem::EndOfSegment => self.control.begin_flush().await,
            InboundItem::Interrupt { epoch } => {
                if let Err(err) = self.engine.interrupt().await {
                    error!(error = %err, epoch, "Engine interrupt failed");
                    stats::bump(&self.stats.engine_errors);
                }
                // Applied even on failure, otherwise output would stay muted
                self.control.mark_interrupt_applied(epoch);
                debug!(epoch, "Interrupt applied");
            }
        }
    }

    async fn forward_audio(&self, audio: SubmittedAudio) {
        if audio.epoch != self.control.requested_epoch() {
            stats::bump(&self.stats.stale_chunks_discarded);
            debug!(session_id = %audio.session_id, epoch = audio.epoch, "Discarding audio from before interrupt");
            return;
        }

        let duration = audio.chunk.duration_secs();
        match self
            .engine
            .push_audio(audio.chunk.pcm, audio.chunk.sample_rate, false)
            .await
        {
            Ok(()) => {
                self.control.record_pushed(duration, audio.epoch);
                stats::bump(&self.stats.audio_chunks_forwarded);
            }
            Err(err) => {
                error!(session_id = %audio.session_id, error = %err, "Failed to push audio to engine");
                stats::bump(&self.stats.engine_errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::testing::{EngineCall, ScriptedEngine};
    use crate::media::AudioChunk;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        queue: Arc<InboundQueue>,
        engine: Arc<ScriptedEngine>,
        control: Arc<ControlPlane>,
        stats: Arc<RelayStats>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        start_with_queue(100)
    }

    fn start_with_queue(max_chunks: usize) -> Harness {
        let queue = Arc::new(InboundQueue::new(max_chunks, 1 << 24));
        let engine = Arc::new(ScriptedEngine::new());
        let stats = Arc::new(RelayStats::default());
        let control = Arc::new(ControlPlane::new(
            Arc::clone(&queue),
            engine.clone(),
            AppConfig::default().flush,
            16000,
            Arc::clone(&stats),
        ));
        let pump = InboundPump::new(
            Arc::clone(&queue),
            engine.clone(),
            Arc::clone(&control),
            Arc::clone(&stats),
        );
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(pump.run(rx));
        Harness {
            queue,
            engine,
            control,
            stats,
            shutdown,
            task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_audio_forwarded_in_order() {
        let h = start();
        for bytes in [3200, 1600, 640] {
            h.control.submit_audio("client_1", AudioChunk::silence(bytes, 16000));
        }
        settle().await;

        let pushes: Vec<usize> = h
            .engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Push { bytes, last_chunk: false } => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(pushes, vec![3200, 1600, 640]);
        assert!((h.control.snapshot().pushed_secs - 0.17).abs() < 1e-9);
        assert!(h.queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_clients_forwarded_once_in_client_order() {
        const CLIENTS: u16 = 4;
        const CHUNKS: u16 = 50;
        let h = start_with_queue(1000);

        let senders: Vec<_> = (0..CLIENTS)
            .map(|client| {
                let control = Arc::clone(&h.control);
                std::thread::spawn(move || {
                    let session_id = format!("client_{}", client);
                    for seq in 0..CHUNKS {
                        // First sample names the client, second the sequence number
                        let samples = [client as i16, seq as i16, 0, 0];
                        control.submit_audio(&session_id, AudioChunk::from_samples(&samples, 16000));
                        if seq % 10 == 0 {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        let total = (CLIENTS * CHUNKS) as u64;
        tokio::time::timeout(Duration::from_secs(10), async {
            while h.stats.audio_chunks_forwarded.load(Ordering::Relaxed) < total {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let pushed = h.engine.pushed.lock().clone();
        assert_eq!(pushed.len(), total as usize);

        let mut next_seq = vec![0i16; CLIENTS as usize];
        for pcm in pushed {
            let client = i16::from_le_bytes([pcm[0], pcm[1]]) as usize;
            let seq = i16::from_le_bytes([pcm[2], pcm[3]]);
            assert_eq!(seq, next_seq[client], "client {} out of order", client);
            next_seq[client] += 1;
        }
        assert!(next_seq.iter().all(|seq| *seq == CHUNKS as i16));
        assert_eq!(h.stats.audio_chunks_dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_does_not_stop_pump() {
        let h = start();
        *h.engine.fail_pushes.lock() = true;
        h.control.submit_audio("client_1", AudioChunk::silence(3200, 16000));
        settle().await;
        assert_eq!(h.stats.engine_errors.load(Ordering::Relaxed), 1);

        *h.engine.fail_pushes.lock() = false;
        h.control.submit_audio("client_1", AudioChunk::silence(3200, 16000));
        settle().await;
        assert_eq!(h.stats.audio_chunks_forwarded.load(Ordering::Relaxed), 1);
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn test_end_pushes_trailing_silence() {
        let h = start();
        h.control.submit_audio("client_1", AudioChunk::silence(3200, 16000));
        h.control.request_flush();
        settle().await;

        assert_eq!(
            h.engine.calls(),
            vec![
                EngineCall::Push {
                    bytes: 3200,
                    last_chunk: false
                },
                EngineCall::Push {
                    bytes: 320,
                    last_chunk: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_interrupt_reaches_engine_and_is_applied() {
        let h = start();
        let epoch = h.control.interrupt();
        settle().await;

        assert_eq!(h.engine.calls(), vec![EngineCall::Interrupt]);
        assert_eq!(h.control.applied_epoch(), epoch);
    }

    #[tokio::test]
    async fn test_shutdown_stops_pump() {
        let h = start();
        h.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
    }
}
