//! Run loop, expiry and shutdown.

use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use webctl_core::ExpiryPolicy;

use super::Controller;
use crate::app::Application;
use crate::error::ControllerError;
use crate::notifier::{Descriptor, Dispatch, NotifierKind};
use crate::sync::lock;
use crate::transport::RequestStream;

/// Sweep period once shutdown was requested.
const SHUTDOWN_SWEEP_INTERVAL: Duration = Duration::from_millis(20);

/// Ready pairs from one readiness wait, with the registry version polled.
type ReadyBatch = (u64, Vec<(Descriptor, NotifierKind)>);

impl<A: Application> Controller<A> {
    /// Serve `stream` until shutdown completes.
    ///
    /// The loop multiplexes incoming requests, descriptor readiness, expiry
    /// ticks and the shutdown signal. It returns once shutdown was requested
    /// (or the stream ended), every session is gone and the worker pool has
    /// drained.
    pub async fn run<S: RequestStream>(
        self: &Arc<Self>,
        mut stream: S,
    ) -> Result<(), ControllerError> {
        if let Some(fixed) = &self.config.single_session_id {
            let entry = self.entry_points.first().ok_or(ControllerError::NoEntryPoint)?;
            self.registry.create_or_get(fixed, entry);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = sweep_ticker(self.config.sweep_interval);
        let mut draining = false;
        let mut readiness: Option<JoinHandle<ReadyBatch>> = None;

        info!(
            expiry_policy = ?self.config.expiry_policy,
            sweep_interval_ms =
                u64::try_from(self.config.sweep_interval.as_millis()).unwrap_or(u64::MAX),
            "Run loop started"
        );

        loop {
            let accepting = self.is_running();
            if !accepting && !draining {
                draining = true;
                ticker = sweep_ticker(SHUTDOWN_SWEEP_INTERVAL);
            }
            let ticking = !accepting || self.config.expiry_policy == ExpiryPolicy::Timer;
            if readiness.is_none() {
                readiness = self.start_readiness_wait();
            }

            tokio::select! {
                request = stream.next_request(), if accepting => {
                    if let Some(request) = request {
                        self.handle_request(request).await;
                    } else {
                        info!("Request stream ended");
                        self.force_shutdown();
                    }
                }
                ready = join_readiness(&mut readiness) => {
                    readiness = None;
                    self.deliver_ready(ready);
                }
                () = self.notifiers.changed(), if readiness.is_none() => {
                    debug!("Socket notifiers changed");
                }
                _ = ticker.tick(), if ticking => {
                    if !self.expire_sessions() {
                        break;
                    }
                }
                changed = shutdown_rx.changed(), if accepting => {
                    if changed.is_ok() {
                        debug!("Shutdown signalled");
                    }
                }
            }
        }

        if let Some(handle) = readiness.take() {
            handle.abort();
        }
        self.pool.drain().await;
        self.notifiers.clear();
        info!("Run loop stopped");
        Ok(())
    }

    #[cfg(unix)]
    fn start_readiness_wait(&self) -> Option<JoinHandle<ReadyBatch>> {
        let set = self.notifiers.poll_set();
        if set.is_empty() {
            return None;
        }
        let timeout = self.config.poll_interval;
        Some(tokio::task::spawn_blocking(move || {
            let ready = crate::notifier::wait_ready(&set, timeout).unwrap_or_else(|e| {
                warn!(error = %e, "Readiness wait failed");
                Vec::new()
            });
            (set.version(), ready)
        }))
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_self)]
    const fn start_readiness_wait(&self) -> Option<JoinHandle<ReadyBatch>> {
        None
    }

    fn deliver_ready(self: &Arc<Self>, ready: Result<ReadyBatch, JoinError>) {
        let (version, pairs) = match ready {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Readiness task failed");
                return;
            }
        };
        if version != self.notifiers.version() {
            debug!("Discarding readiness from stale snapshot");
            return;
        }
        for (descriptor, kind) in pairs {
            if self.socket_selected(descriptor, kind) == Dispatch::Stale {
                break;
            }
        }
    }

    /// Tear down idle sessions past their timeout.
    ///
    /// During shutdown every session not currently in use is torn down, once
    /// the requests accepted before shutdown have left the worker pool.
    /// Returns whether further sweeps are needed: `false` once shutdown was
    /// requested and no sessions remain.
    pub fn expire_sessions(&self) -> bool {
        let now = Instant::now();
        *lock(&self.last_sweep) = now;
        let shutting_down = !self.is_running();
        // Queued requests may still be waiting for an idle session.
        let close_idle = shutting_down && self.pool.pending() == 0;

        for expired in self.registry.collect_expired(now, close_idle) {
            if close_idle {
                info!(session_id = %expired.session_id, "Session closed for shutdown");
            } else {
                info!(
                    session_id = %expired.session_id,
                    idle_secs = expired.idle.as_secs(),
                    "Session expired"
                );
            }
            expired.teardown();
        }

        !(shutting_down && self.registry.is_empty())
    }

    /// Request shutdown: stop accepting requests and wake the run loop.
    ///
    /// Sessions are torn down by the run loop as their in-flight handlers
    /// finish.
    pub fn force_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(sessions = self.registry.count(), "Controller shutting down");
        self.pool.close();
        self.shutdown_tx.send_replace(true);
    }

    /// Shut down without a run loop: wait for queued work, then tear down
    /// every session once its lock is free.
    pub async fn shutdown(&self) {
        self.force_shutdown();
        self.pool.drain().await;
        for session in self.registry.drain() {
            let mut state = session.lock().await;
            state.kill();
        }
        self.notifiers.clear();
        info!("Controller shut down");
    }

    /// Remove a session and tear it down once its lock is free.
    ///
    /// Must not be called while holding that session's lock.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let Some(session) = self.registry.remove(session_id) else {
            return false;
        };
        let mut state = session.lock().await;
        state.kill();
        true
    }

    /// Give a session a new id, generated when `new_id` is `None`.
    ///
    /// The next response for the session carries the new id in `Set-Cookie`.
    pub fn switch_session(
        &self,
        session_id: &str,
        new_id: Option<&str>,
    ) -> Result<String, ControllerError> {
        self.registry.switch_id(session_id, new_id)
    }
}

fn sweep_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn join_readiness(
    readiness: &mut Option<JoinHandle<ReadyBatch>>,
) -> Result<ReadyBatch, JoinError> {
    match readiness {
        Some(handle) => handle.await,
        None => pending().await,
    }
}
