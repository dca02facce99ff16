//! Server side of the endpoint mapper: shared state, accept loop and
//! per-connection handling.

mod handler;
mod listener;
mod state;

pub use handler::handle_connection;
pub use listener::Listener;
pub use state::{HandlerGuard, IdleTimer, ServiceState};
