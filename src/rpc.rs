//! RPC runtime seam.
//!
//! The elected leader also serves the endpoint mapper over the RPC runtime.
//! That runtime is abstracted behind [`RpcTransport`] so the coordinator can
//! be driven by the built-in [`LocalRpcTransport`] or a test double.

use std::sync::{Mutex, PoisonError};

use crate::error::Result;

/// Well-known endpoints the endpoint mapper itself is reachable on.
pub const EPMAPPER_BINDINGS: &[(&str, &str)] =
    &[("ncacn_np", r"\pipe\epmapper"), ("ncalrpc", "epmapper")];

/// Operations the coordinator needs from the RPC runtime.
pub trait RpcTransport: Send + Sync {
    fn register_protocol_and_endpoint(&self, protocol_sequence: &str, endpoint: &str)
        -> Result<()>;

    fn register_interface(&self) -> Result<()>;

    /// Start serving registered interfaces.
    fn listen(&self) -> Result<()>;

    /// Best effort; failures are logged by the implementation.
    fn unregister_interface(&self);

    fn stop_listening(&self);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct RpcRegistration {
    endpoints: Vec<(String, String)>,
    interface_registered: bool,
    listening: bool,
}

/// In-process transport that records registrations and logs them.
#[derive(Debug, Default)]
pub struct LocalRpcTransport {
    inner: Mutex<RpcRegistration>,
}

impl LocalRpcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoints(&self) -> Vec<(String, String)> {
        self.lock().endpoints.clone()
    }

    pub fn is_interface_registered(&self) -> bool {
        self.lock().interface_registered
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listening
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RpcRegistration> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RpcTransport for LocalRpcTransport {
    fn register_protocol_and_endpoint(
        &self,
        protocol_sequence: &str,
        endpoint: &str,
    ) -> Result<()> {
        tracing::debug!(protseq = protocol_sequence, endpoint, "RPC endpoint registered");
        self.lock()
            .endpoints
            .push((protocol_sequence.to_string(), endpoint.to_string()));
        Ok(())
    }

    fn register_interface(&self) -> Result<()> {
        tracing::debug!("RPC interface registered");
        self.lock().interface_registered = true;
        Ok(())
    }

    fn listen(&self) -> Result<()> {
        tracing::debug!("RPC listening");
        self.lock().listening = true;
        Ok(())
    }

    fn unregister_interface(&self) {
        tracing::debug!("RPC interface unregistered");
        self.lock().interface_registered = false;
    }

    fn stop_listening(&self) {
        tracing::debug!("RPC stopped listening");
        self.lock().listening = false;
    }
}
