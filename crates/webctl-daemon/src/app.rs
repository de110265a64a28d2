//! Application capability and entry-point table.
//!
//! The controller treats per-session application logic as opaque: an entry
//! point constructs an [`Application`] for a new session, the application
//! processes requests while the session lock is held, and is torn down when
//! the session ends.

use std::sync::Arc;

use crate::request::{Request, Response};

/// Per-session application object.
pub trait Application: Send + 'static {
    /// Handle one request. Called with the session lock held.
    fn process(&mut self, request: &Request) -> Result<Response, AppError>;

    /// Release session resources. Called at most once, with the session lock held.
    fn teardown(&mut self);
}

/// Identity handed to an application constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub entry_path: String,
}

/// Application constructor bound to an entry point.
pub type CreateApplication<A> =
    Arc<dyn Fn(&SessionInfo) -> Result<A, AppError> + Send + Sync + 'static>;

/// Errors raised by application hooks.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The request failed; the session stays usable.
    #[error("Application error: {0}")]
    Failed(String),

    /// The session state can no longer be trusted.
    #[error("Session state corrupted: {0}")]
    Corrupted(String),
}

impl AppError {
    /// Whether the session must be torn down after this error.
    pub const fn corrupts_session(&self) -> bool {
        matches!(self, Self::Corrupted(_))
    }
}

/// A registered path bound to an application constructor.
pub struct EntryPoint<A> {
    path: String,
    create: CreateApplication<A>,
}

impl<A> Clone for EntryPoint<A> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            create: Arc::clone(&self.create),
        }
    }
}

impl<A> std::fmt::Debug for EntryPoint<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<A> EntryPoint<A> {
    /// Path this entry point is deployed at.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn constructor(&self) -> CreateApplication<A> {
        Arc::clone(&self.create)
    }

    fn matches_prefix(&self, path: &str) -> bool {
        path.strip_prefix(self.path.as_str())
            .is_some_and(|rest| self.path.ends_with('/') || rest.starts_with('/'))
    }
}

/// Table of entry points, matched against request paths.
pub struct EntryPoints<A> {
    entries: Vec<EntryPoint<A>>,
}

impl<A> Default for EntryPoints<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<A> EntryPoints<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point, replacing any previous one at the same path.
    #[must_use]
    pub fn with<F>(mut self, path: impl Into<String>, create: F) -> Self
    where
        F: Fn(&SessionInfo) -> Result<A, AppError> + Send + Sync + 'static,
    {
        self.add(path, create);
        self
    }

    /// Register an entry point, replacing any previous one at the same path.
    pub fn add<F>(&mut self, path: impl Into<String>, create: F)
    where
        F: Fn(&SessionInfo) -> Result<A, AppError> + Send + Sync + 'static,
    {
        let path = normalize(path.into());
        self.entries.retain(|e| e.path != path);
        self.entries.push(EntryPoint {
            path,
            create: Arc::new(create),
        });
    }

    /// Find the entry point serving `path`.
    ///
    /// An exact match wins; otherwise the longest registered prefix ending at
    /// a `/` boundary.
    pub fn resolve(&self, path: &str) -> Option<&EntryPoint<A>> {
        if let Some(exact) = self.entries.iter().find(|e| e.path == path) {
            return Some(exact);
        }
        self.entries
            .iter()
            .filter(|e| e.matches_prefix(path))
            .max_by_key(|e| e.path.len())
    }

    /// The first registered entry point, used for single-session mode.
    pub fn first(&self) -> Option<&EntryPoint<A>> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(path: String) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Nop;

    impl Application for Nop {
        fn process(&mut self, _request: &Request) -> Result<Response, AppError> {
            Ok(Response::ok(Vec::new()))
        }

        fn teardown(&mut self) {}
    }

    fn table() -> EntryPoints<Nop> {
        EntryPoints::new()
            .with("/", |_| Ok(Nop))
            .with("/app", |_| Ok(Nop))
            .with("/app/admin", |_| Ok(Nop))
    }

    #[test]
    fn exact_match_wins() {
        let table = table();
        assert_eq!(table.resolve("/app").unwrap().path(), "/app");
        assert_eq!(table.resolve("/app/admin").unwrap().path(), "/app/admin");
    }

    #[test]
    fn longest_prefix_on_segment_boundary() {
        let table = table();
        assert_eq!(table.resolve("/app/admin/users").unwrap().path(), "/app/admin");
        assert_eq!(table.resolve("/app/page").unwrap().path(), "/app");
        // "/application" is not inside "/app".
        assert_eq!(table.resolve("/application").unwrap().path(), "/");
    }

    #[test]
    fn no_match_without_root() {
        let table: EntryPoints<Nop> = EntryPoints::new().with("app", |_| Ok(Nop));
        assert_eq!(table.first().unwrap().path(), "/app");
        assert!(table.resolve("/other").is_none());
    }

    #[test]
    fn re_registering_replaces() {
        let mut table = table();
        table.add("/app", |_| Err(AppError::Failed("replaced".into())));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn corrupted_errors_tear_down() {
        assert!(AppError::Corrupted("x".into()).corrupts_session());
        assert!(!AppError::Failed("x".into()).corrupts_session());
    }
}
