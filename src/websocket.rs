//! # WebSocket Relay Handler
//!
//! One actor per connected client. Clients connect to `/ws` (or `/`), stream
//! raw PCM up as binary frames and receive paced video, audio and
//! end-of-speech frames back.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: admitted if a slot is free, otherwise closed with a policy-violation code
//! 2. **Welcome**: the server sends a `connected` JSON message with the media formats
//! 3. **Audio Streaming**: binary messages are int16 LE mono PCM, any size of whole samples
//! 4. **Control**: JSON text messages (`end`, `interrupt`, `subscribe`, `audio_input`)
//! 5. **Output**: binary frames in the relay wire format, filtered by subscription
//!
//! ## Message Format:
//! - **Client → Server**: binary PCM, JSON commands
//! - **Server → Client**: binary media frames, JSON status and error notices

use std::sync::Arc;
use std::time::Instant;

use actix::prelude::*;
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws::{self, CloseCode, CloseReason};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::media::AudioChunk;
use crate::protocol::{ClientCommand, ServerMessage, StatusPayload};
use crate::relay::registry::Transport;
use crate::relay::{Outbound, Relay, SessionId};
use crate::state::AppState;

/// WebSocket actor for one relay client.
///
/// ## Actor Model:
/// Inbound messages are handled on the actor's own context; outbound media
/// arrives as [`Outbound`] messages from the render pump through the actor's
/// bounded mailbox, which doubles as the client's send queue.
pub struct RelaySocket {
    /// Registry key for this connection
    session_id: SessionId,

    /// Shared relay core
    relay: Arc<Relay>,

    /// Application configuration
    config: AppConfig,

    /// Remote address, for logs
    peer: Option<String>,

    /// Last time anything was heard from the client
    last_heartbeat: Instant,

    /// Registered with the relay; rejected sockets ignore all traffic
    admitted: bool,
}

impl RelaySocket {
    pub fn new(session_id: SessionId, relay: Arc<Relay>, peer: Option<String>) -> Self {
        let config = relay.config().clone();
        Self {
            session_id,
            relay,
            config,
            peer,
            last_heartbeat: Instant::now(),
            admitted: false,
        }
    }

    /// Validate a PCM payload and queue it for the engine.
    fn handle_audio(&mut self, pcm: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        if pcm.is_empty() || pcm.len() % 2 != 0 {
            let err = RelayError::Protocol(format!(
                "audio frames must hold whole int16 samples, got {} bytes",
                pcm.len()
            ));
            warn!(session_id = %self.session_id, error = %err, "Rejected audio frame");
            self.send_json(ctx, &ServerMessage::error(&err));
            return;
        }

        let chunk = AudioChunk::new(pcm, self.config.audio.sample_rate);
        debug!(session_id = %self.session_id, bytes = chunk.byte_len(), "Audio chunk received");

        let dropped = self.relay.control().submit_audio(&self.session_id, chunk);
        if dropped > 0 {
            self.send_json(
                ctx,
                &ServerMessage::Status {
                    data: StatusPayload::AudioOverflow {
                        dropped_chunks: dropped,
                    },
                },
            );
        }
    }

    /// Parse and dispatch a JSON text message.
    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let command = match ClientCommand::parse(text) {
            Ok(command) => command,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "Invalid control message");
                self.send_json(ctx, &ServerMessage::error(&err));
                return;
            }
        };

        match command {
            ClientCommand::End => {
                let started = self.relay.control().request_flush();
                info!(session_id = %self.session_id, coalesced = !started, "End of segment received");
            }
            ClientCommand::Interrupt => {
                let epoch = self.relay.control().interrupt();
                info!(session_id = %self.session_id, epoch, "Interrupt received");
            }
            ClientCommand::Subscribe { video, audio } => {
                if let Some(subscription) =
                    self.relay
                        .registry()
                        .update_subscription(&self.session_id, video, audio)
                {
                    self.send_json(
                        ctx,
                        &ServerMessage::Status {
                            data: StatusPayload::Subscribed {
                                client_id: self.session_id.clone(),
                                video: subscription.video,
                                audio: subscription.audio,
                            },
                        },
                    );
                }
            }
            ClientCommand::AudioInput { pcm, sample_rate } => {
                let expected = self.config.audio.sample_rate;
                match sample_rate {
                    Some(rate) if rate != expected => {
                        let err = RelayError::Protocol(format!(
                            "sample rate {} not supported, send {} Hz",
                            rate, expected
                        ));
                        warn!(session_id = %self.session_id, error = %err, "Rejected audio_input");
                        self.send_json(ctx, &ServerMessage::error(&err));
                    }
                    _ => self.handle_audio(Bytes::from(pcm), ctx),
                }
            }
            ClientCommand::Unknown(name) => {
                let err = RelayError::Protocol(format!("unknown command '{}'", name));
                warn!(session_id = %self.session_id, command = %name, "Unknown command");
                self.send_json(ctx, &ServerMessage::error(&err));
            }
        }
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        ctx.text(message.to_json());
    }

    /// Ping on an interval and drop clients that stopped answering.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = self.config.server.heartbeat_interval();
        let timeout = self.config.server.client_timeout();

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(self.config.server.send_queue_capacity);

        let transport: Arc<dyn Transport> = Arc::new(ctx.address().recipient::<Outbound>());
        if let Err(err) = self.relay.registry().register(self.session_id.clone(), transport) {
            warn!(session_id = %self.session_id, peer = ?self.peer, error = %err, "Connection refused");
            ctx.close(Some(CloseReason {
                code: CloseCode::Policy,
                description: Some(err.to_string()),
            }));
            ctx.stop();
            return;
        }

        self.admitted = true;
        info!(session_id = %self.session_id, peer = ?self.peer, "Client connected");
        self.send_json(ctx, &ServerMessage::welcome(&self.session_id, &self.config));
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if self.admitted {
            self.relay.registry().unregister(&self.session_id);
            info!(session_id = %self.session_id, "Client disconnected");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                let err = RelayError::Transport(err.to_string());
                warn!(session_id = %self.session_id, error = %err, "WebSocket receive failed, closing");
                ctx.stop();
                return;
            }
        };
        if !self.admitted {
            return;
        }
        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Binary(bytes) => self.handle_audio(bytes, ctx),
            ws::Message::Text(text) => self.handle_text(&text, ctx),
            ws::Message::Ping(payload) => ctx.pong(&payload),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                debug!(session_id = %self.session_id, ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                let err = RelayError::Protocol("fragmented messages are not supported".to_string());
                self.send_json(ctx, &ServerMessage::error(&err));
            }
            ws::Message::Nop => {}
        }
    }
}

/// Outbound traffic from the relay.
impl Handler<Outbound> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Media { kind, payload } => {
                // Subscription may have changed since the frame was queued
                if self.relay.registry().wants(&self.session_id, kind) {
                    ctx.binary(payload);
                }
            }
            Outbound::Text(text) => ctx.text(text),
            Outbound::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a [`RelaySocket`]. The
/// connection limit is enforced once the actor starts, so a refused client
/// still completes the handshake and then receives a close frame it can read.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);
    let relay = Arc::clone(&state.relay);
    let session_id = relay.registry().next_session_id();
    debug!(session_id = %session_id, peer = ?peer, "WebSocket upgrade requested");

    let socket = RelaySocket::new(session_id, relay, peer);
    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(state.config.server.max_message_bytes)
        .start()
}
