pub mod auth;
pub mod middleware;
pub mod sessions;
pub mod state;

// Re-export the session handlers to make them easily accessible
// to the binary that will build the web server router.
pub use middleware::{rate_limit_monitor, require_auth};
pub use sessions::{
    cancel_session_handler, create_session_handler, end_session_handler, get_session_handler,
    list_sessions_handler, mark_ready_handler, monitor_session_handler,
};
