//! Transport module - well-known local address and the master mutex.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//! - A cross-process lock used for leader election

mod lock;
mod pipe;

pub use lock::{MasterGuard, MasterMutex};
pub use pipe::{connect, probe, ClientStream, Pending, PipeListener, PipeStream, Probe};
