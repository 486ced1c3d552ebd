//! # Application State
//!
//! Shared state handed to every HTTP handler and websocket actor through
//! `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: One [`Relay`] is shared by every connection and both pumps
//! - **Thread safety**: actix runs each worker on its own thread; `Arc` lets
//!   them all hold the same relay without copying it
//!
//! ### Interior mutability lives below this level
//! `AppState` itself never changes after startup. Everything that does
//! change (sessions, the segment state, counters) is owned by the relay and
//! guarded there by locks or atomics, so handlers only ever need `&AppState`.

use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::relay::Relay;

/// State shared across all request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: cloning copies the config and bumps the `Arc`
///   count; the relay itself is never duplicated
/// - **Instant**: monotonic start time for uptime reporting
#[derive(Clone)]
pub struct AppState {
    /// Configuration the relay was started with (read-only at runtime)
    pub config: AppConfig,

    /// The running relay: registry, control plane and pumps
    pub relay: Arc<Relay>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, relay: Arc<Relay>) -> Self {
        Self {
            config,
            relay,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Fraction of client slots in use (0.0 to 1.0).
    pub fn capacity_usage(&self) -> f64 {
        let max = self.config.server.max_clients;
        if max == 0 {
            return 0.0;
        }
        self.relay.registry().len() as f64 / max as f64
    }
}
