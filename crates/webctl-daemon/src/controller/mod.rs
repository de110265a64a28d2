//! The request controller.
//!
//! [`Controller`] owns the session registry, the notifier registry and the
//! worker pool. Requests enter through [`Controller::handle_request`] (or the
//! run loop), out-of-band work through [`Controller::post`], and readiness
//! events through [`Controller::socket_selected`].

mod dispatch;
mod post;
mod run;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::app::{Application, EntryPoints};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::notifier::{Descriptor, NotifierKind, NotifierRegistry, SocketNotifier};
use crate::pool::WorkerPool;
use crate::request::Request;
use crate::session::{SessionRegistry, UploadProgress};
use crate::sync::lock;

/// Session-multiplexing request controller.
///
/// Shared as `Arc<Controller<A>>`; there is no global instance.
pub struct Controller<A: Application> {
    config: ControllerConfig,
    entry_points: EntryPoints<A>,
    registry: SessionRegistry<A>,
    notifiers: Arc<NotifierRegistry>,
    upload_urls: Mutex<HashSet<String>>,
    pool: WorkerPool,
    runtime: Handle,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    last_sweep: Mutex<Instant>,
}

impl<A: Application> Controller<A> {
    /// Create a controller on the current tokio runtime.
    pub fn new(
        config: ControllerConfig,
        entry_points: EntryPoints<A>,
    ) -> Result<Arc<Self>, ControllerError> {
        if config.single_session_id.is_some() && entry_points.is_empty() {
            return Err(ControllerError::NoEntryPoint);
        }
        let runtime =
            Handle::try_current().map_err(|e| ControllerError::NoRuntime(e.to_string()))?;
        let pool = WorkerPool::new(config.worker_threads, &runtime);
        let registry = SessionRegistry::new(config.session_id_length, config.session_timeout);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            threaded = config.threaded,
            workers = pool.workers(),
            session_timeout_secs = config.session_timeout.as_secs(),
            entry_points = entry_points.len(),
            single_session = config.single_session_id.is_some(),
            "Controller created"
        );

        Ok(Arc::new(Self {
            config,
            entry_points,
            registry,
            notifiers: Arc::new(NotifierRegistry::new()),
            upload_urls: Mutex::new(HashSet::new()),
            pool,
            runtime,
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            last_sweep: Mutex::new(Instant::now()),
        }))
    }

    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Whether shutdown has not been requested.
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    /// Number of live sessions. Informational only.
    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Generate an unpredictable session id not currently in use.
    pub fn generate_session_id(&self) -> String {
        self.registry.generate_id()
    }

    /// Expect progress callbacks for uploads to `url`.
    pub fn add_upload_progress_url(&self, url: impl Into<String>) {
        let url = url.into();
        debug!(url = %url, "Upload progress URL added");
        lock(&self.upload_urls).insert(url);
    }

    pub fn remove_upload_progress_url(&self, url: &str) {
        if lock(&self.upload_urls).remove(url) {
            debug!(url, "Upload progress URL removed");
        }
    }

    fn is_upload_url(&self, request: &Request) -> bool {
        let urls = lock(&self.upload_urls);
        urls.contains(request.path()) || urls.contains(&request.url())
    }

    /// Last reported progress of an upload in a session.
    pub async fn upload_progress(&self, session_id: &str, url: &str) -> Option<UploadProgress> {
        let session = self.registry.get(session_id)?;
        let state = session.lock().await;
        state.upload_progress(url)
    }

    /// Register a socket notifier, replacing any for the same pair.
    ///
    /// Returns the generation assigned to the entry.
    pub fn add_socket_notifier(&self, notifier: SocketNotifier) -> u64 {
        self.notifiers.add(notifier)
    }

    /// Remove the notifier for a pair. Safe while it is being dispatched.
    pub fn remove_socket_notifier(&self, descriptor: Descriptor, kind: NotifierKind) -> bool {
        self.notifiers.remove(descriptor, kind)
    }

    pub fn socket_notifier_count(&self) -> usize {
        self.notifiers.len()
    }
}

impl<A: Application> std::fmt::Debug for Controller<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
