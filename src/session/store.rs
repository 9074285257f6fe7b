use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::Session;

/// Shared handle to one device's session.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Concurrent map of device id to session.
///
/// Uses `DashMap` so that lookups for different devices never contend on
/// a global lock. Each session sits behind its own async mutex, held by
/// the caller across record store calls.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `device_id`, creating an idle one on first
    /// sight. The boolean is true when this call created it.
    pub fn get_or_create(&self, device_id: &str) -> (SessionHandle, bool) {
        if let Some(existing) = self.sessions.get(device_id) {
            return (Arc::clone(existing.value()), false);
        }

        match self.sessions.entry(device_id.to_string()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let handle = Arc::new(Mutex::new(Session::new(device_id)));
                e.insert(Arc::clone(&handle));
                (handle, true)
            }
        }
    }

    /// Returns the session for `device_id` if it exists.
    pub fn get(&self, device_id: &str) -> Option<SessionHandle> {
        self.sessions.get(device_id).map(|e| Arc::clone(e.value()))
    }

    /// Returns the number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the tracked device ids in no particular order.
    pub fn device_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let store = SessionStore::new();
        let (first, created) = store.get_or_create("pump-1");
        assert!(created);

        let (second, created) = store.get_or_create("pump-1");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);

        assert_eq!(second.lock().await.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_session() {
        let store = Arc::new(SessionStore::new());
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.spawn(async move { store.get_or_create("pump-7").1 });
        }

        let mut created = 0;
        while let Some(res) = tasks.join_next().await {
            if res.expect("task should not panic") {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let store = SessionStore::new();
        assert!(store.get("nope").is_none());
        assert!(store.is_empty());
        store.get_or_create("a");
        store.get_or_create("b");
        let mut ids = store.device_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
