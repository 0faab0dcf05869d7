//! Directory of live sessions.
//!
//! Presence in the directory is what "live" means: the coordinator removes
//! a session here first on disconnect, so engine calls still in flight for
//! it can tell that their result has no owner anymore.

use crate::actors::SessionHandle;
use common::types::SessionId;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct SessionDirectory {
    inner: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.inner.lock().insert(handle.id(), handle);
    }

    pub fn remove(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.inner.lock().remove(&session_id)
    }

    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.inner.lock().get(&session_id).cloned()
    }

    #[must_use]
    pub fn is_live(&self, session_id: SessionId) -> bool {
        self.inner.lock().contains_key(&session_id)
    }

    /// Every live session except `session_id`.
    #[must_use]
    pub fn ids_excluding(&self, session_id: SessionId) -> Vec<SessionId> {
        self.inner
            .lock()
            .keys()
            .copied()
            .filter(|id| *id != session_id)
            .collect()
    }

    /// Remove and return every session (worker death, shutdown).
    pub fn drain(&self) -> Vec<SessionHandle> {
        self.inner.lock().drain().map(|(_, handle)| handle).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
