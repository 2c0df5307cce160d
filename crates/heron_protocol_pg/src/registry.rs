use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use heron_common::error::{CompileError, HeronError, HeronResult};

/// Cross-connection view of a session: identity plus the cooperative
/// interrupt flags another connection may raise.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: i32,
    pub secret_key: i32,
    pub user: String,
    pub database: String,
    pub started_at: Instant,
    cancel: AtomicBool,
    disconnect: AtomicBool,
    /// Socket clone. DISCONNECT shuts down its read half so a blocked read
    /// wakes up while the FATAL notice can still be written.
    socket: Mutex<Option<TcpStream>>,
}

impl SessionHandle {
    pub fn new(id: i32, user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            id,
            secret_key: random_secret_key(),
            user: user.into(),
            database: database.into(),
            started_at: Instant::now(),
            cancel: AtomicBool::new(false),
            disconnect: AtomicBool::new(false),
            socket: Mutex::new(None),
        }
    }

    /// A handle not attached to any registry or socket.
    pub fn detached(id: i32) -> Arc<Self> {
        Arc::new(Self::new(id, "heron", "heron"))
    }

    pub fn attach_socket(&self, socket: TcpStream) {
        *self.socket.lock() = Some(socket);
    }

    /// Flag the in-flight query as canceled; it notices at its next
    /// cursor-open or row-fetch boundary.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Ask the session to terminate and wake it if it is waiting on the client.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(socket) = self.socket.lock().take() {
            if let Err(e) = socket.shutdown(Shutdown::Read) {
                tracing::debug!("session {}: socket shutdown: {}", self.id, e);
            }
        }
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }

    /// Raise a pending interrupt. Cancel is consumed; disconnect persists.
    pub fn check_interrupts(&self) -> HeronResult<()> {
        if self.disconnect.load(Ordering::SeqCst) {
            return Err(HeronError::AdminTerminated);
        }
        if self.cancel.swap(false, Ordering::SeqCst) {
            tracing::info!("query canceled for session {}", self.id);
            heron_observability::record_cancellation();
            return Err(HeronError::Canceled);
        }
        Ok(())
    }

    /// Drop a cancel that arrived after the query it targeted finished.
    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }
}

fn random_secret_key() -> i32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as i32
}

/// Live sessions by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<i32, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<SessionHandle>) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn unregister(&self, id: i32) {
        self.sessions.remove(&id);
    }

    pub fn get(&self, id: i32) -> HeronResult<Arc<SessionHandle>> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CompileError::UnknownSession(id).into())
    }

    /// Protocol CancelRequest: only honoured with the matching secret key.
    pub fn cancel_with_key(&self, id: i32, secret_key: i32) -> bool {
        match self.sessions.get(&id) {
            Some(entry) if entry.secret_key == secret_key => {
                entry.request_cancel();
                tracing::info!("cancel request accepted for session {}", id);
                true
            }
            Some(_) => {
                tracing::warn!("cancel request rejected for session {}: wrong secret key", id);
                false
            }
            None => {
                tracing::debug!("cancel request for unknown session {}", id);
                false
            }
        }
    }

    /// Ask every live session to terminate.
    pub fn disconnect_all(&self) {
        for entry in self.sessions.iter() {
            entry.request_disconnect();
        }
    }

    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
