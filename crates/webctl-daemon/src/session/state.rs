//! Session handle and the state guarded by its exclusive lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};
use tracing::debug;

use crate::app::{AppError, Application, CreateApplication, EntryPoint, SessionInfo};
use crate::event::ApplicationEvent;
use crate::sync::lock;

/// Bytes seen so far for a pending upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub received: u64,
    pub total: u64,
}

/// State mutated only while the session lock is held.
pub struct SessionState<A> {
    app: Option<A>,
    create: Option<CreateApplication<A>>,
    uploads: HashMap<String, UploadProgress>,
    dead: bool,
}

impl<A: Application> SessionState<A> {
    fn new(create: CreateApplication<A>) -> Self {
        Self {
            app: None,
            create: Some(create),
            uploads: HashMap::new(),
            dead: false,
        }
    }

    /// Whether the session was torn down. A holder that waited for the lock
    /// must re-resolve the session instead of using it.
    pub const fn is_dead(&self) -> bool {
        self.dead
    }

    /// Whether the application has been constructed.
    pub const fn is_started(&self) -> bool {
        self.app.is_some()
    }

    pub const fn app_mut(&mut self) -> Option<&mut A> {
        self.app.as_mut()
    }

    /// Return the application, constructing it on first use.
    pub(crate) fn start(&mut self, info: &SessionInfo) -> Result<&mut A, AppError> {
        if self.dead {
            return Err(AppError::Failed("session is dead".into()));
        }
        if self.app.is_none() {
            let create = self
                .create
                .take()
                .ok_or_else(|| AppError::Corrupted("application constructor missing".into()))?;
            debug!(session_id = %info.session_id, "Creating application");
            self.app = Some(create(info)?);
        }
        self.app
            .as_mut()
            .ok_or_else(|| AppError::Corrupted("application missing".into()))
    }

    /// Tear the application down and mark the session dead.
    pub(crate) fn kill(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;
        self.create = None;
        self.uploads.clear();
        if let Some(mut app) = self.app.take() {
            app.teardown();
        }
    }

    pub fn upload_progress(&self, url: &str) -> Option<UploadProgress> {
        self.uploads.get(url).copied()
    }

    pub(crate) fn record_upload(&mut self, url: String, received: u64, total: u64) {
        if received >= total {
            self.uploads.remove(&url);
        } else {
            self.uploads.insert(url, UploadProgress { received, total });
        }
    }
}

struct EventQueue<A> {
    pending: VecDeque<ApplicationEvent<A>>,
    draining: bool,
}

/// A session: an id, an exclusive lock around its state, and bookkeeping
/// readable without that lock.
pub struct Session<A> {
    id: RwLock<String>,
    entry_path: String,
    timeout: Duration,
    last_activity: Mutex<Instant>,
    state: Arc<AsyncMutex<SessionState<A>>>,
    events: Mutex<EventQueue<A>>,
}

impl<A: Application> Session<A> {
    pub(crate) fn new(id: String, entry: &EntryPoint<A>, timeout: Duration) -> Self {
        Self {
            id: RwLock::new(id),
            entry_path: entry.path().to_string(),
            timeout,
            last_activity: Mutex::new(Instant::now()),
            state: Arc::new(AsyncMutex::new(SessionState::new(entry.constructor()))),
            events: Mutex::new(EventQueue {
                pending: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Current session id. Changes when the session is switched.
    pub fn id(&self) -> String {
        self.id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_id(&self, id: String) {
        *self.id.write().unwrap_or_else(PoisonError::into_inner) = id;
    }

    pub fn entry_path(&self) -> &str {
        &self.entry_path
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id(),
            entry_path: self.entry_path.clone(),
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record activity now.
    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Idle time measured against `now`; zero if touched after `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_activity))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.idle_for(now) > self.timeout
    }

    /// Acquire the session lock. Waiters are served in FIFO order.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState<A>> {
        self.state.lock().await
    }

    pub(crate) async fn lock_owned(&self) -> OwnedMutexGuard<SessionState<A>> {
        Arc::clone(&self.state).lock_owned().await
    }

    /// Take the session lock only if nobody holds it.
    pub(crate) fn try_lock_owned(&self) -> Option<OwnedMutexGuard<SessionState<A>>> {
        Arc::clone(&self.state).try_lock_owned().ok()
    }

    /// Queue an event. Returns `true` when the caller must start a drainer.
    pub(crate) fn enqueue_event(&self, event: ApplicationEvent<A>) -> bool {
        let mut queue = lock(&self.events);
        queue.pending.push_back(event);
        if queue.draining {
            false
        } else {
            queue.draining = true;
            true
        }
    }

    /// Pop the next event, ending the drain when the queue is empty.
    pub(crate) fn next_event(&self) -> Option<ApplicationEvent<A>> {
        let mut queue = lock(&self.events);
        let event = queue.pending.pop_front();
        if event.is_none() {
            queue.draining = false;
        }
        event
    }
}

impl<A> std::fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("entry_path", &self.entry_path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::app::EntryPoints;
    use crate::request::{Request, Response};

    struct Counter {
        teardowns: Arc<AtomicUsize>,
    }

    impl Application for Counter {
        fn process(&mut self, _request: &Request) -> Result<Response, AppError> {
            Ok(Response::ok("ok"))
        }

        fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(teardowns: &Arc<AtomicUsize>, created: &Arc<AtomicUsize>) -> Session<Counter> {
        let teardowns = Arc::clone(teardowns);
        let created = Arc::clone(created);
        let entries = EntryPoints::new().with("/", move |_| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Counter {
                teardowns: Arc::clone(&teardowns),
            })
        });
        Session::new(
            "abc".into(),
            entries.first().unwrap(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn application_created_lazily_once() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let session = session(&teardowns, &created);
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let info = session.info();
        let mut state = session.lock().await;
        assert!(!state.is_started());
        state.start(&info).unwrap();
        state.start(&info).unwrap();
        assert!(state.is_started());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn kill_tears_down_once() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let session = session(&teardowns, &created);
        let info = session.info();

        let mut state = session.lock().await;
        state.start(&info).unwrap();
        state.kill();
        state.kill();
        assert!(state.is_dead());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(state.start(&info).is_err());
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let session = session(&teardowns, &created);

        let guard = session.lock().await;
        assert!(session.try_lock_owned().is_none());
        drop(guard);
        assert!(session.try_lock_owned().is_some());
    }

    #[test]
    fn idle_time_saturates_for_later_touch() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let session = session(&teardowns, &created);
        let sweep_start = Instant::now();
        session.touch();
        assert_eq!(session.idle_for(sweep_start), Duration::ZERO);
        assert!(!session.is_expired(sweep_start));
    }

    #[test]
    fn event_queue_single_drainer() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let session = session(&teardowns, &created);

        assert!(session.enqueue_event(ApplicationEvent::new("abc", |_| {})));
        assert!(!session.enqueue_event(ApplicationEvent::new("abc", |_| {})));
        assert!(session.next_event().is_some());
        assert!(session.next_event().is_some());
        assert!(session.next_event().is_none());
        // Drain finished; the next event starts a new drainer.
        assert!(session.enqueue_event(ApplicationEvent::new("abc", |_| {})));
    }

    #[tokio::test]
    async fn completed_upload_is_forgotten() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let session = session(&teardowns, &created);
        let mut state = session.lock().await;

        state.record_upload("/up".into(), 10, 100);
        assert_eq!(
            state.upload_progress("/up"),
            Some(UploadProgress {
                received: 10,
                total: 100
            })
        );
        state.record_upload("/up".into(), 100, 100);
        assert_eq!(state.upload_progress("/up"), None);
    }
}
