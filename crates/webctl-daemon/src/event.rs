//! Application events: work injected into a session outside the request path.

/// Action run against the session's application with the session lock held.
pub type PrimaryAction<A> = Box<dyn FnOnce(&mut A) + Send + 'static>;

/// Action run without any lock when the target session is unreachable.
pub type FallbackAction = Box<dyn FnOnce() + Send + 'static>;

/// An event to be delivered to a session which is not caused by a request
/// for that session.
pub struct ApplicationEvent<A> {
    pub session_id: String,
    primary: PrimaryAction<A>,
    fallback: Option<FallbackAction>,
}

impl<A> ApplicationEvent<A> {
    pub fn new<P>(session_id: impl Into<String>, primary: P) -> Self
    where
        P: FnOnce(&mut A) + Send + 'static,
    {
        Self {
            session_id: session_id.into(),
            primary: Box::new(primary),
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Run the fallback, discarding the primary action.
    pub(crate) fn run_fallback(self) {
        if let Some(fallback) = self.fallback {
            fallback();
        }
    }

    pub(crate) fn into_parts(self) -> (PrimaryAction<A>, Option<FallbackAction>) {
        (self.primary, self.fallback)
    }
}

impl<A> std::fmt::Debug for ApplicationEvent<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationEvent")
            .field("session_id", &self.session_id)
            .field("has_fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn fallback_runs_without_primary() {
        let primary_runs = Arc::new(AtomicUsize::new(0));
        let fallback_runs = Arc::new(AtomicUsize::new(0));

        let p = Arc::clone(&primary_runs);
        let f = Arc::clone(&fallback_runs);
        let event = ApplicationEvent::<u32>::new("s1", move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        })
        .with_fallback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        event.run_fallback();
        assert_eq!(primary_runs.load(Ordering::SeqCst), 0);
        assert_eq!(fallback_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn primary_mutates_target() {
        let event = ApplicationEvent::<u32>::new("s1", |n| *n += 5);
        let (primary, fallback) = event.into_parts();
        let mut value = 1;
        primary(&mut value);
        assert_eq!(value, 6);
        assert!(fallback.is_none());
    }
}
