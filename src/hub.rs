use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Handle for one registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientSession {
    pub id: Uuid,
}

/// Registry of connected observers. Each session owns a bounded outbox that
/// its writer task drains, so messages reach one session in the order they
/// were queued. A session whose outbox is closed or full is dropped.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, mpsc::Sender<String>>>>,
    capacity: usize,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn register(&self) -> (ClientSession, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let session = ClientSession { id: Uuid::new_v4() };
        self.lock().insert(session.id, tx);
        tracing::info!(session = %session.id, clients = self.len(), "client registered");
        (session, rx)
    }

    pub fn remove(&self, session: ClientSession) {
        if self.lock().remove(&session.id).is_some() {
            tracing::info!(session = %session.id, "client removed");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Delivers `message` to every session and returns how many accepted it.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("failed to encode broadcast: {}", err);
                return 0;
            }
        };

        let snapshot: Vec<(Uuid, mpsc::Sender<String>)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut failed = Vec::new();
        for (id, tx) in &snapshot {
            if let Err(err) = tx.try_send(payload.clone()) {
                tracing::debug!(session = %id, "dropping client: {}", err);
                failed.push(*id);
            }
        }

        if !failed.is_empty() {
            let mut sessions = self.lock();
            for id in &failed {
                sessions.remove(id);
            }
            tracing::info!(
                removed = failed.len(),
                clients = sessions.len(),
                "pruned unreachable clients"
            );
        }
        snapshot.len() - failed.len()
    }

    /// Delivers `message` to a single session. Failure removes the session.
    pub fn send_to(&self, session: ClientSession, message: &ServerMessage) -> bool {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("failed to encode reply: {}", err);
                return false;
            }
        };
        let tx = match self.lock().get(&session.id) {
            Some(tx) => tx.clone(),
            None => return false,
        };
        if tx.try_send(payload).is_err() {
            self.remove(session);
            return false;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, mpsc::Sender<String>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}
