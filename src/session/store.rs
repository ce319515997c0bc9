//! Session storage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use super::{Session, SessionId};
use crate::error::KnobooError;
use crate::notebook::NotebookId;
use crate::Result;

/// Shared handle to a stored session.
pub type SessionHandle = Arc<Mutex<Session>>;

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<SessionId, (NotebookId, SessionHandle)>,
    by_notebook: HashMap<NotebookId, HashSet<SessionId>>,
}

/// Thread-safe storage for sessions, indexed by notebook.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<StoreInner>,
}

impl SessionStore {
    /// Create a new empty session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `session`, returning its ID and handle.
    pub fn insert(&self, session: Session) -> Result<(SessionId, SessionHandle)> {
        let id = session.id();
        let notebook = session.notebook().clone();
        let handle = Arc::new(Mutex::new(session));

        let mut inner = self.inner.write().map_err(|_| KnobooError::LockPoisoned)?;
        inner
            .by_notebook
            .entry(notebook.clone())
            .or_default()
            .insert(id);
        inner.sessions.insert(id, (notebook, Arc::clone(&handle)));
        Ok((id, handle))
    }

    /// Get the session with the given ID.
    pub fn get(&self, id: &SessionId) -> Result<SessionHandle> {
        let inner = self.inner.read().map_err(|_| KnobooError::LockPoisoned)?;
        inner
            .sessions
            .get(id)
            .map(|(_, handle)| Arc::clone(handle))
            .ok_or_else(|| KnobooError::SessionNotFound(id.to_string()))
    }

    /// Check if a session exists.
    pub fn contains(&self, id: &SessionId) -> Result<bool> {
        let inner = self.inner.read().map_err(|_| KnobooError::LockPoisoned)?;
        Ok(inner.sessions.contains_key(id))
    }

    /// Remove a session from the store.
    ///
    /// Returns the removed session, or None if it didn't exist.
    pub fn remove(&self, id: &SessionId) -> Result<Option<SessionHandle>> {
        let mut inner = self.inner.write().map_err(|_| KnobooError::LockPoisoned)?;
        let Some((notebook, handle)) = inner.sessions.remove(id) else {
            return Ok(None);
        };
        if let Some(ids) = inner.by_notebook.get_mut(&notebook) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_notebook.remove(&notebook);
            }
        }
        Ok(Some(handle))
    }

    /// Sessions opened on `notebook`.
    pub fn notebook_sessions(&self, notebook: &NotebookId) -> Result<Vec<SessionHandle>> {
        let inner = self.inner.read().map_err(|_| KnobooError::LockPoisoned)?;
        let Some(ids) = inner.by_notebook.get(notebook) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(|(_, handle)| Arc::clone(handle))
            .collect())
    }

    /// Get the number of sessions in the store.
    pub fn count(&self) -> usize {
        self.inner.read().map(|i| i.sessions.len()).unwrap_or(0)
    }

    /// List all session IDs.
    pub fn list_ids(&self) -> Result<Vec<SessionId>> {
        let inner = self.inner.read().map_err(|_| KnobooError::LockPoisoned)?;
        Ok(inner.sessions.keys().copied().collect())
    }

    /// Handles of every stored session.
    pub fn handles(&self) -> Result<Vec<SessionHandle>> {
        let inner = self.inner.read().map_err(|_| KnobooError::LockPoisoned)?;
        Ok(inner
            .sessions
            .values()
            .map(|(_, handle)| Arc::clone(handle))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::Access;
    use crate::realm::{Avatar, Permissions};
    use tokio::sync::mpsc;

    fn session(notebook: &str) -> Session {
        let (tx, _rx) = mpsc::unbounded_channel();
        let avatar = Avatar::new("alice".into(), Permissions::ATTACH_SESSIONS);
        Session::open(notebook.into(), avatar, Access::Owner, tx).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SessionStore::new();
        let (id, _) = store.insert(session("nb1")).unwrap();

        assert!(store.contains(&id).unwrap());
        assert_eq!(store.count(), 1);
        let handle = store.get(&id).unwrap();
        assert_eq!(handle.lock().await.id(), id);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = SessionStore::new();
        let result = store.get(&SessionId::from_raw(999_999));
        assert!(matches!(result, Err(KnobooError::SessionNotFound(_))));
    }

    #[test]
    fn test_notebook_index() {
        let store = SessionStore::new();
        let (a, _) = store.insert(session("nb1")).unwrap();
        store.insert(session("nb1")).unwrap();
        store.insert(session("nb2")).unwrap();

        assert_eq!(store.notebook_sessions(&"nb1".into()).unwrap().len(), 2);
        assert_eq!(store.notebook_sessions(&"nb2".into()).unwrap().len(), 1);
        assert!(store.notebook_sessions(&"nb3".into()).unwrap().is_empty());

        assert!(store.remove(&a).unwrap().is_some());
        assert!(store.remove(&a).unwrap().is_none());
        assert_eq!(store.notebook_sessions(&"nb1".into()).unwrap().len(), 1);
        assert_eq!(store.list_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let store = Arc::new(SessionStore::new());
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.insert(session("nb")).unwrap().0)
            })
            .collect();

        let ids: HashSet<SessionId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(store.count(), 100);
        assert_eq!(store.notebook_sessions(&"nb".into()).unwrap().len(), 100);
    }
}
