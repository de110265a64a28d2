//! Controller configuration.

use std::time::Duration;

use webctl_core::{Config, ExpiryPolicy};

/// Runtime configuration for a [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Dispatch requests through the worker pool.
    pub threaded: bool,

    /// Worker pool size (ignored when not threaded).
    pub worker_threads: usize,

    /// Idle time after which a session expires.
    pub session_timeout: Duration,

    /// Length of generated session ids.
    pub session_id_length: usize,

    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,

    /// Whether sweeps are driven by the run loop or by incoming requests.
    pub expiry_policy: ExpiryPolicy,

    /// Serve all requests from this session.
    pub single_session_id: Option<String>,

    /// Uploads declaring more bytes than this are aborted.
    pub max_request_bytes: u64,

    /// Upper bound on one readiness wait.
    pub poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        Self {
            threaded: config.controller.threaded,
            worker_threads: config.controller.worker_threads,
            session_timeout: Duration::from_secs(config.sessions.timeout_secs),
            session_id_length: config.sessions.session_id_length,
            sweep_interval: Duration::from_secs(config.sessions.sweep_interval_secs.max(1)),
            expiry_policy: config.controller.expiry_policy,
            single_session_id: config.controller.single_session_id.clone(),
            max_request_bytes: config.controller.max_request_bytes,
            poll_interval: Duration::from_millis(u64::from(
                config.controller.poll_interval_ms.max(1),
            )),
        }
    }
}

impl ControllerConfig {
    /// Enable or disable pooled dispatch.
    #[must_use]
    pub const fn with_threading(mut self, threaded: bool, worker_threads: usize) -> Self {
        self.threaded = threaded;
        self.worker_threads = worker_threads;
        self
    }

    /// Set the session idle timeout.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the expiry policy.
    #[must_use]
    pub const fn with_expiry_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.expiry_policy = policy;
        self
    }

    /// Route every request to one fixed session.
    #[must_use]
    pub fn with_single_session(mut self, session_id: impl Into<String>) -> Self {
        self.single_session_id = Some(session_id.into());
        self
    }

    /// Set the generated session id length.
    #[must_use]
    pub const fn with_session_id_length(mut self, length: usize) -> Self {
        self.session_id_length = length;
        self
    }

    /// Set the upload size limit.
    #[must_use]
    pub const fn with_max_request_bytes(mut self, max: u64) -> Self {
        self.max_request_bytes = max;
        self
    }

    /// Set the readiness wait bound.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
