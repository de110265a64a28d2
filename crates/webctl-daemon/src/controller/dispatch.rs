//! Request dispatch: entry-point resolution, session resolution, and
//! handler invocation under the session lock.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use webctl_core::ExpiryPolicy;

use super::Controller;
use crate::app::{AppError, Application, EntryPoint, SessionInfo};
use crate::request::{Request, Response};
use crate::session::{
    Session, SessionState, session_cookie_name, session_from_cookie, session_from_query,
};
use crate::sync::lock;

/// Attempts to find a live session before giving up on a request.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

type StateGuard<A> = OwnedMutexGuard<SessionState<A>>;

/// Result of one handler invocation.
enum Invocation {
    Responded(Response),
    Failed(AppError),
    Panicked,
    StartFailed(AppError),
}

impl<A: Application> Controller<A> {
    /// Accept a request.
    ///
    /// Without threading the request is fully handled before this returns.
    /// With threading it is queued on the worker pool and this returns
    /// immediately. The response is delivered on the request's reply channel.
    pub async fn handle_request(self: &Arc<Self>, mut request: Request) {
        if !self.is_running() {
            debug!(path = request.path(), "Rejecting request during shutdown");
            request.respond(Response::unavailable());
            return;
        }

        if self.config.expiry_policy == ExpiryPolicy::OnRequest {
            self.sweep_if_due();
        }

        if self.config.threaded {
            let this = Arc::clone(self);
            if let Err(e) = self.pool.submit(async move { this.dispatch(request).await }) {
                warn!(error = %e, "Failed to queue request");
            }
        } else {
            Arc::clone(self).dispatch(request).await;
        }
    }

    /// Record streamed upload progress for `request`.
    ///
    /// Returns whether the transport should keep delivering the body. Data
    /// past the declared total, or past the maximum request size, is refused.
    pub async fn request_data_received(
        &self,
        request: &Request,
        current: u64,
        total: u64,
    ) -> bool {
        if !self.is_running() {
            return false;
        }
        let max = self.config.max_request_bytes;
        if total > max || current > max {
            warn!(
                path = request.path(),
                current,
                total,
                max,
                "Upload exceeds maximum request size"
            );
            return false;
        }
        if current > total {
            warn!(path = request.path(), current, total, "Upload exceeds declared size");
            return false;
        }
        if !self.is_upload_url(request) {
            return true;
        }

        let Some(entry) = self.entry_points.resolve(request.path()) else {
            return false;
        };
        let Some(session_id) = self.presented_session_id(request, entry) else {
            return false;
        };
        let Some(session) = self.registry.get(&session_id) else {
            debug!(session_id = %session_id, "Upload progress for unknown session");
            return false;
        };

        let mut state = session.lock().await;
        if state.is_dead() {
            return false;
        }
        state.record_upload(request.url(), current, total);
        drop(state);
        session.touch();
        true
    }

    /// Run an opportunistic sweep when the last one is older than the
    /// sweep interval.
    fn sweep_if_due(&self) {
        let now = Instant::now();
        {
            let mut last = lock(&self.last_sweep);
            if now.saturating_duration_since(*last) < self.config.sweep_interval {
                return;
            }
            *last = now;
        }
        self.expire_sessions();
    }

    async fn dispatch(self: Arc<Self>, mut request: Request) {
        let Some(entry) = self.entry_points.resolve(request.path()).cloned() else {
            debug!(path = request.path(), "No entry point for request");
            request.respond(Response::not_found());
            return;
        };

        let presented = self.presented_session_id(&request, &entry);
        let reply = request.take_reply();
        let response = self.serve(&entry, presented.as_deref(), request).await;
        reply.send(response);
    }

    async fn serve(
        &self,
        entry: &EntryPoint<A>,
        presented: Option<&str>,
        request: Request,
    ) -> Response {
        let mut locked = None;
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let Some(session) = self.resolve_session(entry, presented) else {
                return Response::unavailable();
            };
            let guard = session.lock_owned().await;
            if guard.is_dead() {
                // Torn down while we waited; the id may already be reused.
                drop(guard);
                self.registry.remove_if_same(&session);
                continue;
            }
            locked = Some((session, guard));
            break;
        }
        let Some((session, guard)) = locked else {
            warn!(path = request.path(), "Could not resolve a live session");
            return Response::unavailable();
        };

        session.touch();
        let info = session.info();
        debug!(session_id = %info.session_id, path = request.path(), "Handling request");

        let Some((mut guard, invocation)) = self
            .run_locked(guard, move |state| invoke(state, &info, &request))
            .await
        else {
            return Response::internal_error();
        };

        let session_id = session.id();
        let response = match invocation {
            Invocation::Responded(response) => {
                if response.ends_session() {
                    info!(session_id = %session_id, "Session ended by application");
                    guard.kill();
                }
                response
            }
            Invocation::Failed(e) if e.corrupts_session() => {
                error!(session_id = %session_id, error = %e, "Handler corrupted session state");
                guard.kill();
                Response::internal_error()
            }
            Invocation::Failed(e) => {
                warn!(session_id = %session_id, error = %e, "Handler failed");
                Response::internal_error()
            }
            Invocation::Panicked => {
                error!(session_id = %session_id, "Handler panicked, tearing down session");
                guard.kill();
                Response::internal_error()
            }
            Invocation::StartFailed(e) => {
                error!(session_id = %session_id, error = %e, "Failed to create application");
                guard.kill();
                Response::internal_error()
            }
        };

        session.touch();
        let dead = guard.is_dead();
        drop(guard);

        if dead {
            self.registry.remove_if_same(&session);
            return response;
        }
        if self.config.single_session_id.is_some() || presented == Some(session_id.as_str()) {
            return response;
        }
        response.with_header(
            "Set-Cookie",
            format!(
                "{}={session_id}; Path={}; HttpOnly",
                session_cookie_name(entry.path()),
                entry.path()
            ),
        )
    }

    /// Run `f` on the locked session state, on a blocking worker thread when
    /// threading is enabled.
    pub(super) async fn run_locked<R, F>(
        &self,
        mut guard: StateGuard<A>,
        f: F,
    ) -> Option<(StateGuard<A>, R)>
    where
        F: FnOnce(&mut SessionState<A>) -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.config.threaded {
            let result = f(&mut guard);
            return Some((guard, result));
        }
        match tokio::task::spawn_blocking(move || {
            let result = f(&mut guard);
            (guard, result)
        })
        .await
        {
            Ok(done) => Some(done),
            Err(e) => {
                error!(error = %e, "Blocking handler task failed");
                None
            }
        }
    }

    /// The session id the client presented, or the fixed id in
    /// single-session mode.
    pub(super) fn presented_session_id(
        &self,
        request: &Request,
        entry: &EntryPoint<A>,
    ) -> Option<String> {
        if let Some(fixed) = &self.config.single_session_id {
            return Some(fixed.clone());
        }
        let length = self.registry.id_length();
        let from_cookie = request
            .header("Cookie")
            .map(|cookies| session_from_cookie(cookies, entry.path(), length))
            .filter(|id| !id.is_empty());
        from_cookie.or_else(|| session_from_query(request.query(), length))
    }

    /// Find the session serving this request, creating one when needed.
    ///
    /// Returns `None` during shutdown if a new session would be required.
    fn resolve_session(
        &self,
        entry: &EntryPoint<A>,
        presented: Option<&str>,
    ) -> Option<Arc<Session<A>>> {
        let running = self.is_running();

        if let Some(fixed) = &self.config.single_session_id {
            return if running {
                Some(self.registry.create_or_get(fixed, entry).0)
            } else {
                self.registry.lookup(fixed)
            };
        }

        if let Some(id) = presented
            && let Some(session) = self.registry.lookup(id)
        {
            if session.entry_path() == entry.path() {
                return Some(session);
            }
            debug!(
                session_id = id,
                entry_path = entry.path(),
                "Session belongs to another entry point"
            );
        }

        running.then(|| self.registry.create_new(entry))
    }
}

fn invoke<A: Application>(
    state: &mut SessionState<A>,
    info: &SessionInfo,
    request: &Request,
) -> Invocation {
    let app = match state.start(info) {
        Ok(app) => app,
        Err(e) => return Invocation::StartFailed(e),
    };
    match catch_unwind(AssertUnwindSafe(|| app.process(request))) {
        Ok(Ok(response)) => Invocation::Responded(response),
        Ok(Err(e)) => Invocation::Failed(e),
        Err(_) => Invocation::Panicked,
    }
}
