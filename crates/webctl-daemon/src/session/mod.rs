//! Session management and multiplexing.

mod id;
mod registry;
mod state;

pub use id::{
    SESSION_TOKEN, generate_session_id, is_valid_session_id, session_cookie_name,
    session_from_cookie, session_from_query,
};
pub use registry::{ExpiredSession, SessionRegistry};
pub use state::{Session, SessionState, UploadProgress};
