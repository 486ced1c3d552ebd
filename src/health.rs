use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let snapshot = state.relay.snapshot();
    let usage = state.capacity_usage();

    let status = if snapshot.pumps_running { "healthy" } else { "degraded" };
    let body = json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "engine": {
            "name": snapshot.engine,
            "running": snapshot.pumps_running,
            "segment": snapshot.control.segment
        },
        "clients": {
            "connected": snapshot.clients,
            "max": snapshot.max_clients
        },
        "system": load_status(usage, snapshot.clients, snapshot.max_clients)
    });

    if snapshot.pumps_running {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn relay_stats(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.relay.snapshot();
    let uptime_seconds = state.uptime_seconds();
    let counters = &snapshot.counters;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "clients": {
            "connected": snapshot.clients,
            "max": snapshot.max_clients,
            "sessions": state.relay.registry().sessions()
        },
        "inbound": {
            "queued_items": snapshot.queued_items,
            "queued_audio_bytes": snapshot.queued_audio_bytes,
            "chunks_received": counters.audio_chunks_received,
            "chunks_forwarded": counters.audio_chunks_forwarded,
            "chunks_dropped": counters.audio_chunks_dropped,
            "stale_chunks_discarded": counters.stale_chunks_discarded
        },
        "outbound": {
            "video_frames": counters.video_frames_sent,
            "audio_frames": counters.audio_frames_sent,
            "end_markers": counters.end_markers_sent,
            "bytes_sent": counters.bytes_sent,
            "frames_without_audience": counters.frames_without_audience,
            "stale_frames_discarded": counters.stale_frames_discarded,
            "backlogged_deliveries": counters.backlogged_deliveries,
            "clients_dropped": counters.clients_dropped,
            "bytes_per_second": if uptime_seconds > 0 {
                counters.bytes_sent as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "segments": {
            "state": snapshot.control.segment,
            "requested_epoch": snapshot.control.requested_epoch,
            "applied_epoch": snapshot.control.applied_epoch,
            "flushes_requested": counters.flushes_requested,
            "flushes_coalesced": counters.flushes_coalesced,
            "flushes_completed": counters.flushes_completed,
            "flush_deadlines_hit": counters.flush_deadlines_hit,
            "interrupts": counters.interrupts
        },
        "errors": {
            "engine": counters.engine_errors,
            "encode": counters.encode_errors
        }
    }))
}

fn load_status(usage: f64, connected: usize, max: usize) -> serde_json::Value {
    let status = if usage >= 1.0 {
        "full"
    } else if usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "client_usage_percent": (usage * 100.0).round(),
        "max_clients": max,
        "current_clients": connected,
        "load_warnings": if usage > 0.8 {
            vec!["High client usage - new connections will soon be refused; consider raising server.max_clients"]
        } else {
            vec![]
        }
    })
}
