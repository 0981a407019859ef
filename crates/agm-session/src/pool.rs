//! Process-wide session pool.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::session::{Session, SessionState};

/// Map from session id to session object, guarded by one lock.
///
/// Lookup is get-or-create: any entry point may lazily create the
/// session it names. The read-only [`retrieve`] is for the event
/// trampoline, which must not resurrect freed sessions.
///
/// [`retrieve`]: SessionPool::retrieve
#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
}

impl SessionPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session with `session_id`, creating it in the closed
    /// state if missing.
    pub fn get_or_create(&self, session_id: u32) -> Arc<Session> {
        Arc::clone(
            self.sessions
                .lock()
                .entry(session_id)
                .or_insert_with(|| Arc::new(Session::new(session_id))),
        )
    }

    /// Return the session with `session_id` if it exists.
    pub fn retrieve(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    /// Number of sessions in the pool.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// True when the pool holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close every session best-effort and drop the pool contents.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if session.state() == SessionState::Closed {
                continue;
            }
            if let Err(err) = session.close() {
                warn!(sess = session.id(), %err, "closing session at teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let pool = SessionPool::new();
        let a = pool.get_or_create(5);
        let b = pool.get_or_create(5);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn retrieve_does_not_create() {
        let pool = SessionPool::new();
        assert!(pool.retrieve(9).is_none());
        pool.get_or_create(9);
        assert!(pool.retrieve(9).is_some());
    }

    #[test]
    fn close_all_empties_the_pool() {
        let pool = SessionPool::new();
        pool.get_or_create(1);
        pool.get_or_create(2);
        pool.close_all();
        assert!(pool.is_empty());
    }
}
