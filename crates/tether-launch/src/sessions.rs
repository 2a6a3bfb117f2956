use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Launch-configuration key carrying the id a session registers under.
pub const SESSION_ID_KEY: &str = "_tetherSessionId";

/// Active debug sessions, keyed by session id.
///
/// Each entry is written only by the session it names: [`SessionRegistry::register`] hands out
/// a [`SessionGuard`] that removes the entry when dropped.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, String>>,
    // Bumped on every insert/remove.
    changes: watch::Sender<u64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            changes: watch::channel(0).0,
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh random session id.
    pub fn new_session_id() -> Result<String, getrandom::Error> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes)?;
        Ok(bytes.iter().map(|byte| format!("{byte:02x}")).collect())
    }

    /// Record `id` as active until the returned guard is dropped. Returns `None` if the id is
    /// already taken.
    pub fn register(self: &Arc<Self>, id: impl Into<String>, name: impl Into<String>) -> Option<SessionGuard> {
        let id = id.into();
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&id) {
                return None;
            }
            sessions.insert(id.clone(), name.into());
        }
        self.changes.send_modify(|generation| *generation += 1);
        tracing::debug!(target: "tether.launch", session = %id, "session registered");
        Some(SessionGuard {
            registry: Arc::clone(self),
            id,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Name of the session registered under `id`.
    pub fn name(&self, id: &str) -> Option<String> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Resolves once a session with `id` is registered.
    pub async fn wait_registered(&self, id: &str) {
        self.wait_until(|registry| registry.contains(id)).await;
    }

    /// Resolves once no session with `id` is registered.
    pub async fn wait_removed(&self, id: &str) {
        self.wait_until(|registry| !registry.contains(id)).await;
    }

    /// Resolves once no session at all is registered.
    pub async fn wait_idle(&self) {
        self.wait_until(|registry| registry.is_empty()).await;
    }

    async fn wait_until(&self, mut ready: impl FnMut(&Self) -> bool) {
        // Subscribe before checking so a change in between is not missed.
        let mut changes = self.changes.subscribe();
        loop {
            if ready(self) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    fn remove(&self, id: &str) {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            self.changes.send_modify(|generation| *generation += 1);
            tracing::debug!(target: "tether.launch", session = %id, "session removed");
        }
    }
}

/// Keeps a session registered; dropping it removes the entry.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
