//! Offload server: module handshake, function dispatch and the session loop.

mod dispatcher;
mod listener;
mod session;

pub use dispatcher::Dispatcher;
pub use listener::{StreamServer, StreamServerHandle};
pub use session::{load_module, ServerSession, SessionState, SessionSummary};
