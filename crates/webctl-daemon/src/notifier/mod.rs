//! Socket notifier multiplexing.
//!
//! Notifiers register interest in one (descriptor, kind) pair. When the
//! descriptor becomes ready the run loop calls
//! [`Controller::socket_selected`](crate::Controller::socket_selected), which
//! invokes the callback with the notifier lock released and reports whether
//! the entry survived.

#[cfg(unix)]
mod poller;
mod registry;

use std::fmt;
use std::sync::Arc;

#[cfg(unix)]
pub use poller::{PollSet, wait_ready};
pub use registry::{NotifierRegistry, Registered};

/// Raw descriptor number identifying a notifier.
pub type Descriptor = i32;

/// Readiness a notifier waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifierKind {
    Read,
    Write,
    Exception,
}

impl fmt::Display for NotifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Exception => write!(f, "exception"),
        }
    }
}

/// Callback invoked when the descriptor is ready.
pub type NotifierCallback = Arc<dyn Fn(Descriptor, NotifierKind) + Send + Sync + 'static>;

/// Outcome of delivering a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// No notifier is registered for the pair; nothing ran.
    NotRegistered,
    /// The callback ran and its entry is still registered.
    Delivered,
    /// The entry was removed or replaced while the callback ran. Any
    /// snapshot of ready descriptors is no longer trustworthy.
    Stale,
    /// The callback was queued as an event on its session.
    Posted,
}

/// A registration of interest in one descriptor.
#[derive(Clone)]
pub struct SocketNotifier {
    descriptor: Descriptor,
    kind: NotifierKind,
    callback: NotifierCallback,
    session_id: Option<String>,
    #[cfg(unix)]
    source: Option<Arc<dyn std::os::fd::AsFd + Send + Sync>>,
}

impl SocketNotifier {
    /// A notifier driven externally through `socket_selected`.
    pub fn new<F>(descriptor: Descriptor, kind: NotifierKind, callback: F) -> Self
    where
        F: Fn(Descriptor, NotifierKind) + Send + Sync + 'static,
    {
        Self {
            descriptor,
            kind,
            callback: Arc::new(callback),
            session_id: None,
            #[cfg(unix)]
            source: None,
        }
    }

    /// A notifier whose descriptor the run loop polls for readiness.
    #[cfg(unix)]
    pub fn watching<S, F>(source: Arc<S>, kind: NotifierKind, callback: F) -> Self
    where
        S: std::os::fd::AsFd + Send + Sync + 'static,
        F: Fn(Descriptor, NotifierKind) + Send + Sync + 'static,
    {
        use std::os::fd::AsRawFd;

        let descriptor = source.as_fd().as_raw_fd();
        let source: Arc<dyn std::os::fd::AsFd + Send + Sync> = source;
        Self {
            descriptor,
            kind,
            callback: Arc::new(callback),
            session_id: None,
            source: Some(source),
        }
    }

    /// Deliver the callback through the session's event queue, under its lock.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub const fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub const fn kind(&self) -> NotifierKind {
        self.kind
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn callback(&self) -> NotifierCallback {
        Arc::clone(&self.callback)
    }

    #[cfg(unix)]
    pub(crate) fn source(&self) -> Option<Arc<dyn std::os::fd::AsFd + Send + Sync>> {
        self.source.clone()
    }
}

impl fmt::Debug for SocketNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketNotifier")
            .field("descriptor", &self.descriptor)
            .field("kind", &self.kind)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
