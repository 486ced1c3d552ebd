//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_VIDEO__TARGET_FPS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main relay configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each pump and the connection handler only care about one group of
/// settings, so each gets its own section and is handed a clone of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub flush: FlushConfig,
}

/// Listener and per-connection settings.
///
/// ## Fields:
/// - `host` / `port`: address the websocket server binds to
/// - `max_clients`: concurrent connections admitted before new ones are closed
/// - `max_message_bytes`: largest websocket frame accepted from a client
/// - `heartbeat_interval_secs`: how often the server pings each client
/// - `client_timeout_secs`: silence after which a client is dropped
/// - `send_queue_capacity`: outbound messages buffered per client before frames are skipped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub max_message_bytes: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub send_queue_capacity: usize,
}

/// Inbound audio format and admission limits.
///
/// ## Audio Format:
/// Clients send raw little-endian int16 PCM at `sample_rate` with `channels`
/// channels. `chunk_ms` is the chunk size advertised in the welcome message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub chunk_ms: u32,
    /// Maximum number of audio chunks waiting for the engine
    pub queue_max_chunks: usize,
    /// Maximum number of PCM bytes waiting for the engine
    pub queue_max_bytes: usize,
}

/// Outbound video settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Output cadence the render pump paces to
    pub target_fps: f64,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Frame size produced by the built-in loopback engine
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Flush completion policy.
///
/// ## How flush waits:
/// After the trailing `lastChunk` push, the control plane waits until the
/// engine has emitted `completion_ratio` of the pushed audio duration, or
/// until `max(pending * deadline_multiplier, min_deadline_ms)` elapses.
/// These values are tuning knobs, not a guarantee from the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    pub completion_ratio: f64,
    pub min_deadline_ms: u64,
    pub deadline_multiplier: f64,
    pub poll_interval_ms: u64,
    pub trailing_silence_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8765,
                max_clients: 10,
                max_message_bytes: 1024 * 1024, // 1 MiB per websocket frame
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                send_queue_capacity: 256,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                chunk_ms: 100,
                queue_max_chunks: 100,
                queue_max_bytes: 4 * 1024 * 1024,
            },
            video: VideoConfig {
                target_fps: 25.0,
                jpeg_quality: 80,
                frame_width: 320,
                frame_height: 240,
            },
            flush: FlushConfig {
                completion_ratio: 0.95,
                min_deadline_ms: 2000,
                deadline_multiplier: 2.0,
                poll_interval_ms: 50,
                trailing_silence_bytes: 320, // 10ms of silence at 16kHz
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__MAX_CLIENTS=4`: Override the connection limit
    /// - `APP_VIDEO__JPEG_QUALITY=60`: Override JPEG quality
    /// - `PORT=9000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // required(false): running without a config file is fine
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors here keeps them fatal at startup
    /// instead of surfacing as odd pump behavior later.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_clients == 0 {
            return Err(anyhow::anyhow!("max_clients must be greater than 0"));
        }

        if self.server.send_queue_capacity == 0 {
            return Err(anyhow::anyhow!("send_queue_capacity must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channel count must be non-zero"));
        }

        if self.audio.queue_max_chunks == 0 || self.audio.queue_max_bytes == 0 {
            return Err(anyhow::anyhow!("Audio queue limits must be greater than 0"));
        }

        if !(self.video.target_fps > 0.0) {
            return Err(anyhow::anyhow!("target_fps must be positive"));
        }

        if !(1..=100).contains(&self.video.jpeg_quality) {
            return Err(anyhow::anyhow!("jpeg_quality must be between 1 and 100"));
        }

        if self.video.frame_width == 0
            || self.video.frame_height == 0
            || self.video.frame_width > u16::MAX as u32
            || self.video.frame_height > u16::MAX as u32
        {
            return Err(anyhow::anyhow!("Frame dimensions must fit in 1..=65535"));
        }

        if !(self.flush.completion_ratio > 0.0 && self.flush.completion_ratio <= 1.0) {
            return Err(anyhow::anyhow!("completion_ratio must be in (0, 1]"));
        }

        if !(self.flush.deadline_multiplier.is_finite() && self.flush.deadline_multiplier > 0.0) {
            return Err(anyhow::anyhow!("deadline_multiplier must be a positive finite number"));
        }

        if self.flush.trailing_silence_bytes % 2 != 0 {
            return Err(anyhow::anyhow!("trailing_silence_bytes must be a whole number of int16 samples"));
        }

        Ok(())
    }

    /// Address string handed to `HttpServer::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl FlushConfig {
    /// How long a flush may wait for the engine to catch up.
    ///
    /// `pending_secs` is the pushed audio the engine had not yet emitted
    /// when the wait started.
    pub fn deadline_for(&self, pending_secs: f64) -> Duration {
        // Saturates instead of panicking on an out-of-range product
        let scaled = Duration::try_from_secs_f64((pending_secs * self.deadline_multiplier).max(0.0))
            .unwrap_or(Duration::MAX);
        scaled.max(Duration::from_millis(self.min_deadline_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
