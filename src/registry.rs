//! Process-wide map of live sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session under its id. Fails when the id is already live, so two
    /// connections can never share a workspace or a server process.
    pub fn register(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if sessions.contains_key(session.id()) {
            return Err(GatewayError::DuplicateSession(session.id().to_owned()));
        }
        sessions.insert(session.id().to_owned(), session);
        metrics::gauge!("gateway_active_sessions").set(sessions.len() as f64);
        Ok(())
    }

    pub fn unregister(&self, id: &str) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if sessions.remove(id).is_some() {
            metrics::gauge!("gateway_active_sessions").set(sessions.len() as f64);
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("registry lock poisoned").len()
    }

    /// Clean up every live session. Used by the shutdown path; errors inside
    /// individual cleanups are logged and swallowed so one bad session cannot
    /// keep the rest alive.
    pub async fn shutdown_all(&self) {
        let snapshot: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().expect("registry lock poisoned");
            sessions.values().cloned().collect()
        };
        if snapshot.is_empty() {
            return;
        }
        info!(count = snapshot.len(), "shutting down all sessions");
        for session in snapshot {
            session.cleanup().await;
        }
        let leftover = self.count();
        if leftover > 0 {
            warn!(leftover, "sessions still registered after shutdown");
        }
    }
}
