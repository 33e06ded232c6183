//! The supervisor's view of live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::session::SessionControl;

struct SessionEntry {
    name: String,
    control: mpsc::Sender<SessionControl>,
}

/// Active sessions by id, with their display names and control handles.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, id: String, name: String, control: mpsc::Sender<SessionControl>) {
        self.sessions
            .lock()
            .await
            .insert(id, SessionEntry { name, control });
    }

    /// Update a session's display name (multiplex target selection).
    pub async fn rename(&self, id: &str, name: String) {
        if let Some(entry) = self.sessions.lock().await.get_mut(id) {
            entry.name = name;
        }
    }

    pub async fn name_of(&self, id: &str) -> Option<String> {
        self.sessions.lock().await.get(id).map(|e| e.name.clone())
    }

    /// Remove a finished session, yielding its final display name.
    pub async fn remove(&self, id: &str) -> Option<String> {
        self.sessions.lock().await.remove(id).map(|e| e.name)
    }

    /// The `Active ...` lines SIGUSR2 asks for.
    pub async fn dump_lines(&self) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|e| format!("Active {}", e.name))
            .collect()
    }

    pub async fn dump(&self) {
        for line in self.dump_lines().await {
            log::info!("{}", line);
        }
    }

    /// Ask every session to hang up.
    pub async fn disconnect_all(&self) {
        let controls: Vec<mpsc::Sender<SessionControl>> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|e| e.control.clone())
            .collect();
        for control in controls {
            let _ = control.send(SessionControl::Disconnect).await;
        }
    }
}
