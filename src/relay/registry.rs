//! # Session Registry
//!
//! Tracks every connected client: its outbound transport and which media
//! kinds it wants. The registry is the only shared record of who is
//! connected, and every read and write of it goes through one lock.
//!
//! ## Concurrency:
//! - Admission checks the limit and inserts under a single write lock, so two
//!   racing connections can never both take the last slot
//! - Broadcasts snapshot the recipients under a read lock and deliver outside
//!   it, so a slow client never holds up registration
//! - A transport that reports itself closed during delivery is unregistered
//!   right there; one failing client never stops delivery to the rest

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actix::prelude::*;
use actix_web::web::Bytes;
use actix_web_actors::ws::CloseReason;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};

pub type SessionId = String;

/// What an outbound binary frame carries; decides who receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    /// End-of-speech; delivered regardless of subscriptions
    Marker,
}

/// A message queued for one client's socket.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub enum Outbound {
    Media { kind: MediaKind, payload: Bytes },
    Text(String),
    Close(Option<CloseReason>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The client is gone; drop it from the registry
    Disconnected,
    /// The client's send queue is full; this message is skipped
    Backlogged,
}

/// Outbound side of a client connection.
pub trait Transport: Send + Sync {
    fn deliver(&self, message: Outbound) -> Result<(), DeliveryError>;

    /// Deliver past the send queue bound. Never reports `Backlogged`.
    fn deliver_unbounded(&self, message: Outbound) -> Result<(), DeliveryError>;
}

impl Transport for Recipient<Outbound> {
    fn deliver(&self, message: Outbound) -> Result<(), DeliveryError> {
        self.try_send(message).map_err(|err| match err {
            SendError::Full(_) => DeliveryError::Backlogged,
            SendError::Closed(_) => DeliveryError::Disconnected,
        })
    }

    fn deliver_unbounded(&self, message: Outbound) -> Result<(), DeliveryError> {
        if !self.connected() {
            return Err(DeliveryError::Disconnected);
        }
        self.do_send(message);
        Ok(())
    }
}

/// Media kinds a client has asked for. New clients get both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub video: bool,
    pub audio: bool,
}

impl Default for Subscription {
    fn default() -> Self {
        Self { video: true, audio: true }
    }
}

impl Subscription {
    pub fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
            MediaKind::Marker => true,
        }
    }
}

struct SessionEntry {
    transport: Arc<dyn Transport>,
    subscription: Subscription,
    connected_at: DateTime<Utc>,
}

/// Per-session view exposed on the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub subscription: Subscription,
    pub connected_at: DateTime<Utc>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub backlogged: usize,
    pub removed: usize,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    max_clients: usize,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_clients,
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh session id (`client_1`, `client_2`, ...).
    pub fn next_session_id(&self) -> SessionId {
        format!("client_{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Admit a session if there is room.
    ///
    /// ## Returns:
    /// - **Ok(())**: registered with the default subscription (video and audio)
    /// - **Err(MaxClientsExceeded)**: the registry is full; nothing was changed
    pub fn register(&self, session_id: SessionId, transport: Arc<dyn Transport>) -> RelayResult<()> {
        let mut sessions = self.sessions.write();

        if sessions.len() >= self.max_clients {
            return Err(RelayError::MaxClientsExceeded {
                limit: self.max_clients,
            });
        }
        if sessions.contains_key(&session_id) {
            return Err(RelayError::Internal(format!("session {} already registered", session_id)));
        }

        sessions.insert(
            session_id.clone(),
            SessionEntry {
                transport,
                subscription: Subscription::default(),
                connected_at: Utc::now(),
            },
        );
        info!(session_id = %session_id, total = sessions.len(), "Session registered");
        Ok(())
    }

    /// Remove a session. Safe to call more than once.
    pub fn unregister(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            info!(session_id = %session_id, total = self.len(), "Session unregistered");
        }
        removed
    }

    /// Apply a partial subscription change; absent flags keep their value.
    ///
    /// Returns the resulting subscription, or `None` if the session is unknown.
    pub fn update_subscription(
        &self,
        session_id: &str,
        video: Option<bool>,
        audio: Option<bool>,
    ) -> Option<Subscription> {
        let mut sessions = self.sessions.write();
        let entry = sessions.get_mut(session_id)?;
        if let Some(video) = video {
            entry.subscription.video = video;
        }
        if let Some(audio) = audio {
            entry.subscription.audio = audio;
        }
        debug!(session_id = %session_id, subscription = ?entry.subscription, "Subscription updated");
        Some(entry.subscription)
    }

    pub fn subscription(&self, session_id: &str) -> Option<Subscription> {
        self.sessions.read().get(session_id).map(|entry| entry.subscription)
    }

    /// Whether `session_id` is registered and currently wants `kind`.
    pub fn wants(&self, session_id: &str, kind: MediaKind) -> bool {
        self.subscription(session_id)
            .map(|subscription| subscription.wants(kind))
            .unwrap_or(false)
    }

    pub fn has_subscribers(&self, kind: MediaKind) -> bool {
        self.sessions
            .read()
            .values()
            .any(|entry| entry.subscription.wants(kind))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Deliver `payload` to every session subscribed to `kind`.
    ///
    /// Video and audio are skipped for clients whose send queue is full;
    /// end-of-speech markers are always queued.
    pub fn broadcast(&self, kind: MediaKind, payload: Bytes) -> BroadcastReport {
        let recipients: Vec<(SessionId, Arc<dyn Transport>)> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter(|(_, entry)| entry.subscription.wants(kind))
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.transport)))
                .collect()
        };

        let mut report = BroadcastReport::default();
        for (session_id, transport) in recipients {
            let message = Outbound::Media {
                kind,
                payload: payload.clone(),
            };
            let delivery = match kind {
                MediaKind::Marker => transport.deliver_unbounded(message),
                MediaKind::Video | MediaKind::Audio => transport.deliver(message),
            };
            match delivery {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Backlogged) => {
                    debug!(session_id = %session_id, ?kind, "Client send queue full, frame skipped");
                    report.backlogged += 1;
                }
                Err(DeliveryError::Disconnected) => {
                    warn!(session_id = %session_id, "Delivery failed, dropping client");
                    if self.unregister(&session_id) {
                        report.removed += 1;
                    }
                }
            }
        }
        report
    }

    /// Send a text message to every session regardless of subscription.
    pub fn broadcast_text(&self, text: &str) -> BroadcastReport {
        let recipients: Vec<(SessionId, Arc<dyn Transport>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.transport)))
            .collect();

        let mut report = BroadcastReport::default();
        for (session_id, transport) in recipients {
            match transport.deliver(Outbound::Text(text.to_string())) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Backlogged) => report.backlogged += 1,
                Err(DeliveryError::Disconnected) => {
                    if self.unregister(&session_id) {
                        report.removed += 1;
                    }
                }
            }
        }
        report
    }

    /// Close every session and empty the registry.
    pub fn close_all(&self, reason: Option<CloseReason>) -> usize {
        let drained: Vec<(SessionId, SessionEntry)> = self.sessions.write().drain().collect();
        for (session_id, entry) in &drained {
            if entry
                .transport
                .deliver_unbounded(Outbound::Close(reason.clone()))
                .is_err()
            {
                debug!(session_id = %session_id, "Close not delivered, client already gone");
            }
        }
        drained.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: id.clone(),
                subscription: entry.subscription,
                connected_at: entry.connected_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        sessions
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Transport that records deliveries and can be switched to fail.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub delivered: Mutex<Vec<Outbound>>,
        pub failure: Mutex<Option<DeliveryError>>,
    }

    impl RecordingTransport {
        pub fn kinds(&self) -> Vec<MediaKind> {
            self.delivered
                .lock()
                .iter()
                .filter_map(|message| match message {
                    Outbound::Media { kind, .. } => Some(*kind),
                    _ => None,
                })
                .collect()
        }

        pub fn fail_with(&self, error: DeliveryError) {
            *self.failure.lock() = Some(error);
        }
    }

    impl Transport for RecordingTransport {
        fn deliver(&self, message: Outbound) -> Result<(), DeliveryError> {
            if let Some(error) = *self.failure.lock() {
                return Err(error);
            }
            self.delivered.lock().push(message);
            Ok(())
        }

        fn deliver_unbounded(&self, message: Outbound) -> Result<(), DeliveryError> {
            if *self.failure.lock() == Some(DeliveryError::Disconnected) {
                return Err(DeliveryError::Disconnected);
            }
            self.delivered.lock().push(message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;

    fn registry_with(ids: &[&str], max: usize) -> (SessionRegistry, Vec<Arc<RecordingTransport>>) {
        let registry = SessionRegistry::new(max);
        let transports = ids
            .iter()
            .map(|id| {
                let transport = Arc::new(RecordingTransport::default());
                registry.register(id.to_string(), transport.clone()).unwrap();
                transport
            })
            .collect();
        (registry, transports)
    }

    #[test]
    fn test_register_respects_limit() {
        let (registry, _) = registry_with(&["a"], 1);
        let result = registry.register("b".to_string(), Arc::new(RecordingTransport::default()));
        assert_eq!(result, Err(RelayError::MaxClientsExceeded { limit: 1 }));
        assert_eq!(registry.len(), 1);

        // Slot frees up after unregister
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry
            .register("b".to_string(), Arc::new(RecordingTransport::default()))
            .is_ok());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let registry = Arc::new(SessionRegistry::new(5));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let id = registry.next_session_id();
                    registry
                        .register(id, Arc::new(RecordingTransport::default()))
                        .is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_partial_subscription_update() {
        let (registry, _) = registry_with(&["a"], 4);
        let sub = registry.update_subscription("a", Some(false), None).unwrap();
        assert_eq!(sub, Subscription { video: false, audio: true });
        assert!(!registry.wants("a", MediaKind::Video));
        assert!(registry.wants("a", MediaKind::Marker));
        assert!(registry.update_subscription("missing", Some(true), None).is_none());
    }

    #[test]
    fn test_broadcast_honours_subscriptions() {
        let (registry, transports) = registry_with(&["a", "b"], 4);
        registry.update_subscription("b", Some(false), None);

        registry.broadcast(MediaKind::Video, Bytes::from_static(&[1]));
        registry.broadcast(MediaKind::Audio, Bytes::from_static(&[2]));
        registry.broadcast(MediaKind::Marker, Bytes::from_static(&[3]));

        assert_eq!(
            transports[0].kinds(),
            vec![MediaKind::Video, MediaKind::Audio, MediaKind::Marker]
        );
        assert_eq!(transports[1].kinds(), vec![MediaKind::Audio, MediaKind::Marker]);
    }

    #[test]
    fn test_failed_client_is_removed_others_still_served() {
        let (registry, transports) = registry_with(&["a", "b", "c"], 4);
        transports[1].fail_with(DeliveryError::Disconnected);
        transports[2].fail_with(DeliveryError::Backlogged);

        let report = registry.broadcast(MediaKind::Audio, Bytes::from_static(&[2]));
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 1,
                backlogged: 1,
                removed: 1
            }
        );
        assert_eq!(registry.len(), 2);
        assert!(registry.subscription("b").is_none());
        // Backlogged clients stay registered
        assert!(registry.subscription("c").is_some());
    }

    #[test]
    fn test_marker_reaches_backlogged_client() {
        let (registry, transports) = registry_with(&["a", "b"], 4);
        transports[0].fail_with(DeliveryError::Backlogged);
        transports[1].fail_with(DeliveryError::Disconnected);

        let report = registry.broadcast(MediaKind::Video, Bytes::from_static(&[1]));
        assert_eq!(report.backlogged, 1);
        assert!(transports[0].kinds().is_empty());

        let report = registry.broadcast(MediaKind::Marker, Bytes::from_static(&[3]));
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 1,
                backlogged: 0,
                removed: 1
            }
        );
        assert_eq!(transports[0].kinds(), vec![MediaKind::Marker]);
        assert!(registry.subscription("a").is_some());
    }

    #[test]
    fn test_text_reaches_unsubscribed_clients() {
        let (registry, transports) = registry_with(&["a"], 4);
        registry.update_subscription("a", Some(false), Some(false));
        let report = registry.broadcast_text("{}");
        assert_eq!(report.delivered, 1);
        assert!(matches!(&transports[0].delivered.lock()[0], Outbound::Text(t) if t == "{}"));
    }

    #[test]
    fn test_close_all_empties_registry() {
        let (registry, transports) = registry_with(&["a", "b"], 4);
        assert_eq!(registry.close_all(None), 2);
        assert!(registry.is_empty());
        assert!(matches!(transports[0].delivered.lock()[0], Outbound::Close(None)));
    }
}
