//! Posting application events into sessions, and readiness delivery.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::Controller;
use crate::app::{AppError, Application};
use crate::event::ApplicationEvent;
use crate::notifier::{Descriptor, Dispatch, NotifierKind};
use crate::session::{Session, SessionState};

impl<A: Application> Controller<A> {
    /// Run `primary` against the session's application under its lock, or
    /// `fallback` without any lock if the session does not exist.
    ///
    /// Returns whether the event was queued on a live session.
    pub fn post<P, F>(self: &Arc<Self>, session_id: &str, primary: P, fallback: F) -> bool
    where
        P: FnOnce(&mut A) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.post_event(ApplicationEvent::new(session_id, primary).with_fallback(fallback))
    }

    /// Queue an event on its target session.
    ///
    /// Events for one session run in the order posted, one at a time.
    pub fn post_event(self: &Arc<Self>, event: ApplicationEvent<A>) -> bool {
        let Some(session) = self.registry.get(&event.session_id) else {
            debug!(session_id = %event.session_id, "Session gone, running event fallback");
            event.run_fallback();
            return false;
        };

        if session.enqueue_event(event) {
            let this = Arc::clone(self);
            self.runtime.spawn(async move { this.drain_events(session).await });
        }
        true
    }

    async fn drain_events(self: Arc<Self>, session: Arc<Session<A>>) {
        while let Some(event) = session.next_event() {
            let (primary, fallback) = event.into_parts();

            let guard = session.lock_owned().await;
            if guard.is_dead() {
                drop(guard);
                if let Some(fallback) = fallback {
                    fallback();
                }
                continue;
            }

            let info = session.info();
            let run = move |state: &mut SessionState<A>| {
                let app = state.start(&info)?;
                catch_unwind(AssertUnwindSafe(|| primary(app)))
                    .map_err(|_| AppError::Corrupted("event handler panicked".into()))
            };
            let Some((mut guard, result)) = self.run_locked(guard, run).await else {
                continue;
            };

            if let Err(e) = result {
                error!(
                    session_id = %session.id(),
                    error = %e,
                    "Event failed, tearing down session"
                );
                guard.kill();
                drop(guard);
                self.registry.remove_if_same(&session);
            }
        }
    }

    /// Deliver readiness of a (descriptor, kind) pair to its notifier.
    ///
    /// Notifiers bound to a session are posted to it and report
    /// [`Dispatch::Posted`]; if the session is gone the notifier is removed
    /// and the result is [`Dispatch::Stale`]. Unbound notifiers are invoked
    /// directly with the notifier lock released.
    pub fn socket_selected(
        self: &Arc<Self>,
        descriptor: Descriptor,
        kind: NotifierKind,
    ) -> Dispatch {
        let Some(registered) = self.notifiers.lookup(descriptor, kind) else {
            return Dispatch::NotRegistered;
        };
        let Some(session_id) = registered.session_id else {
            return self.notifiers.select(descriptor, kind);
        };

        let generation = registered.generation;
        if self.registry.get(&session_id).is_none() {
            if self.notifiers.remove_if_generation(descriptor, kind, generation) {
                warn!(
                    descriptor,
                    %kind,
                    session_id = %session_id,
                    "Removed notifier of ended session"
                );
            }
            return Dispatch::Stale;
        }
        if !self.notifiers.begin_delivery(descriptor, kind, generation) {
            // Already queued on the session, or replaced since lookup.
            return if self.notifiers.is_current(descriptor, kind, generation) {
                Dispatch::Posted
            } else {
                Dispatch::Stale
            };
        }

        let callback = registered.callback;
        let on_session = Arc::clone(&self.notifiers);
        let on_fallback = Arc::clone(&self.notifiers);
        let posted = self.post(
            &session_id,
            move |_app| {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    if on_session.is_current(descriptor, kind, generation) {
                        callback(descriptor, kind);
                    }
                }));
                on_session.end_delivery(descriptor, kind, generation);
                if let Err(panic) = outcome {
                    resume_unwind(panic);
                }
            },
            move || {
                if on_fallback.remove_if_generation(descriptor, kind, generation) {
                    warn!(descriptor, %kind, "Removed notifier of ended session");
                }
            },
        );

        if posted { Dispatch::Posted } else { Dispatch::Stale }
    }
}
