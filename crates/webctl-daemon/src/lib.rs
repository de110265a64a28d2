//! webctl Daemon Library
//!
//! Core functionality for the webctl daemon:
//! - Session registry with idle expiry and id switching
//! - Request dispatch with per-session mutual exclusion
//! - Out-of-band application events posted into sessions
//! - Socket notifier multiplexing against the run loop
//! - Bounded worker pool for threaded dispatch

pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod notifier;
pub mod pool;
pub mod request;
pub mod session;
mod sync;
pub mod transport;

pub use app::{AppError, Application, EntryPoint, EntryPoints, SessionInfo};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::ControllerError;
pub use event::ApplicationEvent;
pub use notifier::{Dispatch, NotifierKind, SocketNotifier};
pub use request::{Request, Response};
pub use session::session_from_cookie;
