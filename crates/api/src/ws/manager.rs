use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};

use darkroom_core::job::JobId;
use darkroom_core::types::Timestamp;

/// Channel sender half for pushing frames to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Per-session state shared between the inbound dispatcher and the
/// event fan-out task.
#[derive(Default)]
pub struct SessionShared {
    /// Jobs this session submitted and still receives events for.
    jobs: Mutex<HashSet<JobId>>,
    /// Client correlation ids mapped to acked job ids.
    pending: Mutex<HashMap<String, JobId>>,
}

impl SessionShared {
    /// Record ownership of a job (and its corr id, when present).
    pub fn register_job(&self, corr_id: Option<String>, job_id: &JobId) {
        self.jobs
            .lock()
            .expect("session jobs lock poisoned")
            .insert(job_id.clone());
        if let Some(corr) = corr_id {
            self.pending
                .lock()
                .expect("session pending lock poisoned")
                .insert(corr, job_id.clone());
        }
    }

    pub fn owns(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .expect("session jobs lock poisoned")
            .contains(job_id)
    }

    /// Forget a job after its terminal event (or a failed submit).
    pub fn release_job(&self, job_id: &str) {
        self.jobs
            .lock()
            .expect("session jobs lock poisoned")
            .remove(job_id);
        self.pending
            .lock()
            .expect("session pending lock poisoned")
            .retain(|_, v| v != job_id);
    }
}

/// Metadata for a single WebSocket connection.
struct WsConnection {
    sender: WsSender,
    shared: Arc<SessionShared>,
    #[allow(dead_code)]
    connected_at: Timestamp,
}

/// Manages all active WebSocket sessions.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc`
/// and shared across the application.
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new session.
    ///
    /// Returns the receiver half of the outbound frame channel plus the
    /// shared session state for the fan-out task.
    pub async fn add(
        &self,
        session_id: String,
    ) -> (mpsc::UnboundedReceiver<Message>, Arc<SessionShared>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::default());
        let conn = WsConnection {
            sender: tx,
            shared: Arc::clone(&shared),
            connected_at: chrono::Utc::now(),
        };
        self.connections.write().await.insert(session_id, conn);
        (rx, shared)
    }

    /// Remove a session by its ID.
    pub async fn remove(&self, session_id: &str) {
        self.connections.write().await.remove(session_id);
    }

    /// Shared state for a live session, if connected.
    pub async fn session(&self, session_id: &str) -> Option<Arc<SessionShared>> {
        self.connections
            .read()
            .await
            .get(session_id)
            .map(|c| Arc::clone(&c.shared))
    }

    /// Send a frame to one session. Closed channels are silently skipped
    /// (cleanup happens in the session's receive loop).
    pub async fn send_to(&self, session_id: &str, message: Message) {
        let conns = self.connections.read().await;
        if let Some(conn) = conns.get(session_id) {
            let _ = conn.sender.send(message);
        }
    }

    /// Broadcast a frame to every connected session.
    pub async fn broadcast(&self, message: Message) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(message.clone());
        }
    }

    /// Send a Ping frame to every connected session.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a Close frame to every session, then clear the registry.
    /// Used during graceful shutdown.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all WebSocket sessions");
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
