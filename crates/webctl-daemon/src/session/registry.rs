//! Session registry: the authoritative map from session id to session.
//!
//! The registry lock is held only for map mutation and lookup. It is never
//! held while waiting for a session lock: the expiry sweep only *tries*
//! session locks while holding it, and teardown runs after it is released.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use super::id::{generate_session_id, is_valid_session_id};
use super::state::{Session, SessionState};
use crate::app::{Application, EntryPoint};
use crate::error::ControllerError;
use crate::sync::lock;

/// A session removed by an expiry sweep, with its lock still held.
pub struct ExpiredSession<A> {
    pub session_id: String,
    pub idle: Duration,
    guard: OwnedMutexGuard<SessionState<A>>,
}

impl<A: Application> ExpiredSession<A> {
    /// Run the application teardown hook and release the session lock.
    pub fn teardown(mut self) {
        self.guard.kill();
    }
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry<A> {
    sessions: Mutex<HashMap<String, Arc<Session<A>>>>,
    id_length: usize,
    timeout: Duration,
}

impl<A: Application> SessionRegistry<A> {
    pub fn new(id_length: usize, timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            id_length,
            timeout,
        }
    }

    /// Return the session for `id`, creating it if the id is unknown.
    ///
    /// The second value is `true` when this call created the session.
    pub fn create_or_get(&self, id: &str, entry: &EntryPoint<A>) -> (Arc<Session<A>>, bool) {
        let (session, created) = {
            let mut sessions = lock(&self.sessions);
            match sessions.entry(id.to_string()) {
                Entry::Occupied(e) => {
                    e.get().touch();
                    (Arc::clone(e.get()), false)
                }
                Entry::Vacant(v) => {
                    let session = Arc::new(Session::new(id.to_string(), entry, self.timeout));
                    (Arc::clone(v.insert(session)), true)
                }
            }
        };
        if created {
            info!(session_id = id, entry_path = entry.path(), "Created new session");
        }
        (session, created)
    }

    /// Create a session under a freshly generated id.
    pub fn create_new(&self, entry: &EntryPoint<A>) -> Arc<Session<A>> {
        let mut sessions = lock(&self.sessions);
        let id = self.unused_id(&sessions);
        let session = Arc::new(Session::new(id.clone(), entry, self.timeout));
        sessions.insert(id.clone(), Arc::clone(&session));
        drop(sessions);
        info!(session_id = %id, entry_path = entry.path(), "Created new session");
        session
    }

    /// Look up a session without recording activity.
    pub fn get(&self, id: &str) -> Option<Arc<Session<A>>> {
        lock(&self.sessions).get(id).cloned()
    }

    /// Look up a session on behalf of a request, recording activity.
    ///
    /// The touch happens under the registry lock, so a sweep either runs
    /// entirely before it or sees the fresh timestamp.
    pub fn lookup(&self, id: &str) -> Option<Arc<Session<A>>> {
        let sessions = lock(&self.sessions);
        let session = sessions.get(id).cloned();
        if let Some(session) = &session {
            session.touch();
        }
        session
    }

    /// Remove a session. Removing an unknown id is a no-op.
    ///
    /// Callers must not hold the session's lock.
    pub fn remove(&self, id: &str) -> Option<Arc<Session<A>>> {
        let removed = lock(&self.sessions).remove(id);
        if removed.is_some() {
            debug!(session_id = id, "Session removed");
        }
        removed
    }

    /// Remove `session` only if its id still maps to it.
    pub fn remove_if_same(&self, session: &Arc<Session<A>>) -> bool {
        let id = session.id();
        let mut sessions = lock(&self.sessions);
        if sessions.get(&id).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&id);
            drop(sessions);
            debug!(session_id = %id, "Session removed");
            true
        } else {
            false
        }
    }

    /// Re-key a session, generating a new id when none is given.
    ///
    /// Removing the old key and inserting the new one is a single locked
    /// step; lookups never observe the session under both ids or neither.
    pub fn switch_id(&self, old_id: &str, new_id: Option<&str>) -> Result<String, ControllerError> {
        if let Some(id) = new_id
            && !is_valid_session_id(id, self.id_length)
        {
            return Err(ControllerError::InvalidSessionId {
                session_id: id.to_string(),
            });
        }

        let mut sessions = lock(&self.sessions);
        let session = sessions
            .remove(old_id)
            .ok_or_else(|| ControllerError::SessionNotFound {
                session_id: old_id.to_string(),
            })?;

        let id = match new_id {
            Some(id) if id == old_id => id.to_string(),
            Some(id) if sessions.contains_key(id) => {
                sessions.insert(old_id.to_string(), session);
                return Err(ControllerError::SessionExists {
                    session_id: id.to_string(),
                });
            }
            Some(id) => id.to_string(),
            None => self.unused_id(&sessions),
        };

        session.set_id(id.clone());
        sessions.insert(id.clone(), session);
        drop(sessions);

        info!(old_session_id = old_id, session_id = %id, "Session id switched");
        Ok(id)
    }

    /// Remove every session idle past its timeout at `now`.
    ///
    /// Sessions whose lock is held are in use and skipped. With `all_idle`
    /// set (during shutdown), every session not in use is removed.
    pub fn collect_expired(&self, now: Instant, all_idle: bool) -> Vec<ExpiredSession<A>> {
        let mut sessions = lock(&self.sessions);
        let candidates: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| all_idle || s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(session) = sessions.get(&id) else {
                continue;
            };
            let Some(guard) = session.try_lock_owned() else {
                debug!(session_id = %id, "Skipping expiry of busy session");
                continue;
            };
            // Activity recorded as the last holder released the lock.
            if !all_idle && !session.is_expired(now) {
                continue;
            }
            let idle = session.idle_for(now);
            sessions.remove(&id);
            expired.push(ExpiredSession {
                session_id: id,
                idle,
                guard,
            });
        }
        expired
    }

    /// Remove every session, returning them for teardown.
    pub fn drain(&self) -> Vec<Arc<Session<A>>> {
        lock(&self.sessions).drain().map(|(_, s)| s).collect()
    }

    /// Number of sessions. Informational only: it may change immediately.
    pub fn count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Generate an id not currently in use.
    pub fn generate_id(&self) -> String {
        self.unused_id(&lock(&self.sessions))
    }

    pub const fn id_length(&self) -> usize {
        self.id_length
    }

    fn unused_id(&self, sessions: &HashMap<String, Arc<Session<A>>>) -> String {
        loop {
            let id = generate_session_id(self.id_length);
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::app::{AppError, EntryPoints};
    use crate::request::{Request, Response};

    struct Probe {
        teardowns: Arc<AtomicUsize>,
    }

    impl Application for Probe {
        fn process(&mut self, _request: &Request) -> Result<Response, AppError> {
            Ok(Response::ok("ok"))
        }

        fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn entries(teardowns: &Arc<AtomicUsize>) -> EntryPoints<Probe> {
        let teardowns = Arc::clone(teardowns);
        EntryPoints::new().with("/", move |_| {
            Ok(Probe {
                teardowns: Arc::clone(&teardowns),
            })
        })
    }

    #[test]
    fn create_or_get_reuses_existing() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let entry = entries.first().unwrap();

        let (a, created_a) = registry.create_or_get("s1", entry);
        let (b, created_b) = registry.create_or_get("s1", entry);
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn concurrent_create_or_get_creates_one() {
        let registry = Arc::new(SessionRegistry::new(10, Duration::from_secs(60)));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(entries(&teardowns));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let entries = Arc::clone(&entries);
                std::thread::spawn(move || registry.create_or_get("same", entries.first().unwrap()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(s, _)| Arc::ptr_eq(s, first)));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        registry.create_or_get("s1", entries.first().unwrap());

        assert!(registry.remove("s1").is_some());
        assert!(registry.remove("s1").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn remove_then_create_is_brand_new() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let entry = entries.first().unwrap();

        let (old, _) = registry.create_or_get("s1", entry);
        registry.remove("s1");
        let (new, created) = registry.create_or_get("s1", entry);
        assert!(created);
        assert!(!Arc::ptr_eq(&old, &new));
    }

    #[test]
    fn remove_if_same_ignores_replacement() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let entry = entries.first().unwrap();

        let (old, _) = registry.create_or_get("s1", entry);
        registry.remove("s1");
        registry.create_or_get("s1", entry);
        assert!(!registry.remove_if_same(&old));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn create_new_generates_valid_id() {
        let registry = SessionRegistry::new(12, Duration::from_secs(60));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);

        let session = registry.create_new(entries.first().unwrap());
        assert!(is_valid_session_id(&session.id(), 12));
        assert!(registry.get(&session.id()).is_some());
    }

    #[test]
    fn switch_id_rekeys_atomically() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let (session, _) = registry.create_or_get("AAAAAAAAAA", entries.first().unwrap());

        let new_id = registry.switch_id("AAAAAAAAAA", None).unwrap();
        assert_ne!(new_id, "AAAAAAAAAA");
        assert_eq!(session.id(), new_id);
        assert!(registry.get("AAAAAAAAAA").is_none());
        assert!(registry.get(&new_id).is_some());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn switch_to_taken_id_restores_old_key() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let entry = entries.first().unwrap();
        registry.create_or_get("AAAAAAAAAA", entry);
        registry.create_or_get("BBBBBBBBBB", entry);

        let err = registry
            .switch_id("AAAAAAAAAA", Some("BBBBBBBBBB"))
            .unwrap_err();
        assert!(matches!(err, ControllerError::SessionExists { .. }));
        assert!(registry.get("AAAAAAAAAA").is_some());
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn switch_unknown_session_fails() {
        let registry: SessionRegistry<Probe> = SessionRegistry::new(10, Duration::from_secs(60));
        assert!(matches!(
            registry.switch_id("missing", None),
            Err(ControllerError::SessionNotFound { .. })
        ));
        assert!(matches!(
            registry.switch_id("missing", Some("bad id")),
            Err(ControllerError::InvalidSessionId { .. })
        ));
    }

    #[tokio::test]
    async fn expiry_removes_only_idle_sessions() {
        let registry = SessionRegistry::new(10, Duration::from_millis(50));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let entry = entries.first().unwrap();

        registry.create_or_get("idle", entry);
        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.create_or_get("fresh", entry);

        let expired = registry.collect_expired(Instant::now(), false);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, "idle");
        for e in expired {
            e.teardown();
        }
        assert!(registry.get("idle").is_none());
        assert!(registry.get("fresh").is_some());
    }

    #[tokio::test]
    async fn expiry_skips_busy_sessions() {
        let registry = SessionRegistry::new(10, Duration::from_millis(10));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let (session, _) = registry.create_or_get("busy", entries.first().unwrap());

        let guard = session.lock().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.collect_expired(Instant::now(), false).is_empty());
        drop(guard);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn expiry_spares_sessions_touched_after_sweep_start() {
        let registry = SessionRegistry::new(10, Duration::from_millis(10));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        registry.create_or_get("s1", entries.first().unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let sweep_start = Instant::now();
        registry.lookup("s1");
        assert!(registry.collect_expired(sweep_start, false).is_empty());
    }

    #[tokio::test]
    async fn teardown_runs_hook_once() {
        let registry = SessionRegistry::new(10, Duration::from_millis(1));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let (session, _) = registry.create_or_get("s1", entries.first().unwrap());
        {
            let info = session.info();
            let mut state = session.lock().await;
            state.start(&info).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        for e in registry.collect_expired(Instant::now(), false) {
            e.teardown();
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(session.lock().await.is_dead());
    }

    #[test]
    fn shutdown_sweep_takes_all_idle() {
        let registry = SessionRegistry::new(10, Duration::from_secs(3600));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let entries = entries(&teardowns);
        let entry = entries.first().unwrap();
        registry.create_or_get("a", entry);
        registry.create_or_get("b", entry);

        let expired = registry.collect_expired(Instant::now(), true);
        assert_eq!(expired.len(), 2);
        assert!(registry.is_empty());
    }
}
