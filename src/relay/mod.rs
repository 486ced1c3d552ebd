//! # Relay Core
//!
//! Wires the session registry, the inbound queue, the control plane and the
//! two pumps around one [`AvatarEngine`].
//!
//! ## Components:
//! - **registry**: connected clients and their subscriptions
//! - **queue**: bounded FIFO of client audio and control items
//! - **control**: segment lifecycle, interrupt epochs, flush completion
//! - **inbound**: queue → engine
//! - **render**: engine → paced fan-out to clients
//! - **pacing**: frame-rate controller used by the render pump
//! - **stats**: counters for the stats endpoint
//!
//! ## Lifecycle:
//! 1. [`Relay::start`] starts the engine (a failure here is fatal) and spawns both pumps
//! 2. Connection handlers talk to [`Relay::registry`] and [`Relay::control`]
//! 3. [`Relay::stop`] stops the pumps, closes every client and stops the engine

pub mod control;
pub mod inbound;
pub mod pacing;
pub mod queue;
pub mod registry;
pub mod render;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use actix_web_actors::ws::{CloseCode, CloseReason};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::engine::AvatarEngine;
use crate::error::RelayResult;
use crate::protocol::{ServerMessage, StatusPayload};
use control::{ControlPlane, ControlSnapshot};
use inbound::InboundPump;
use queue::InboundQueue;
use registry::SessionRegistry;
use render::RenderPump;
use stats::{RelayStats, StatsSnapshot};

pub use registry::{Outbound, SessionId};

/// How long `stop` waits for each pump before aborting it.
const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Relay {
    config: AppConfig,
    engine: Arc<dyn AvatarEngine>,
    registry: Arc<SessionRegistry>,
    queue: Arc<InboundQueue>,
    control: Arc<ControlPlane>,
    stats: Arc<RelayStats>,
    shutdown: watch::Sender<bool>,
    pumps: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// Relay state reported on the health and stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub engine: String,
    pub clients: usize,
    pub max_clients: usize,
    pub queued_items: usize,
    pub queued_audio_bytes: usize,
    pub pumps_running: bool,
    pub control: ControlSnapshot,
    pub counters: StatsSnapshot,
}

impl Relay {
    /// Start the engine and both pumps.
    ///
    /// ## Errors:
    /// Engine start failures and an unavailable frame stream are returned
    /// to the caller; the relay cannot run without them.
    pub async fn start(config: AppConfig, engine: Arc<dyn AvatarEngine>) -> RelayResult<Arc<Self>> {
        info!(engine = engine.name(), "Starting avatar engine");
        engine.start().await?;
        let frames = engine.frames()?;

        let stats = Arc::new(RelayStats::default());
        let registry = Arc::new(SessionRegistry::new(config.server.max_clients));
        let queue = Arc::new(InboundQueue::new(
            config.audio.queue_max_chunks,
            config.audio.queue_max_bytes,
        ));
        let control = Arc::new(ControlPlane::new(
            Arc::clone(&queue),
            Arc::clone(&engine),
            config.flush.clone(),
            config.audio.sample_rate,
            Arc::clone(&stats),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inbound = InboundPump::new(
            Arc::clone(&queue),
            Arc::clone(&engine),
            Arc::clone(&control),
            Arc::clone(&stats),
        );
        let render = RenderPump::new(
            frames,
            Arc::clone(&registry),
            Arc::clone(&control),
            Arc::clone(&stats),
            config.video.clone(),
        );

        let pumps = vec![
            ("inbound", tokio::spawn(inbound.run(shutdown_rx.clone()))),
            ("render", tokio::spawn(render.run(shutdown_rx))),
        ];

        info!(
            max_clients = config.server.max_clients,
            target_fps = config.video.target_fps,
            "Relay started"
        );

        Ok(Arc::new(Self {
            config,
            engine,
            registry,
            queue,
            control,
            stats,
            shutdown,
            pumps: Mutex::new(pumps),
        }))
    }

    /// Stop the pumps, disconnect every client and stop the engine.
    ///
    /// Safe to call more than once; later calls only repeat the engine stop.
    pub async fn stop(&self) {
        info!("Stopping relay");
        self.shutdown.send_replace(true);
        self.control.cancel_pending_flush();

        let pumps: Vec<_> = self.pumps.lock().drain(..).collect();
        for (name, handle) in pumps {
            let abort = handle.abort_handle();
            match tokio::time::timeout(PUMP_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(pump = name, error = %err, "Pump task failed"),
                Err(_) => {
                    warn!(pump = name, "Pump did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        let notice = ServerMessage::Status {
            data: StatusPayload::ShuttingDown,
        };
        self.registry.broadcast_text(&notice.to_json());
        let closed = self.registry.close_all(Some(CloseReason {
            code: CloseCode::Away,
            description: Some("Server shutting down".to_string()),
        }));
        info!(clients = closed, "Closed client connections");

        if let Err(err) = self.engine.stop().await {
            error!(error = %err, "Engine stop failed");
        }
        info!("Relay stopped");
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn control(&self) -> &Arc<ControlPlane> {
        &self.control
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Both pumps are still running.
    pub fn is_running(&self) -> bool {
        let pumps = self.pumps.lock();
        !pumps.is_empty() && pumps.iter().all(|(_, handle)| !handle.is_finished())
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        let (_, queued_audio_bytes) = self.queue.audio_backlog();
        RelaySnapshot {
            engine: self.engine.name().to_string(),
            clients: self.registry.len(),
            max_clients: self.registry.max_clients(),
            queued_items: self.queue.len(),
            queued_audio_bytes,
            pumps_running: self.is_running(),
            control: self.control.snapshot(),
            counters: self.stats.snapshot(),
        }
    }
}
