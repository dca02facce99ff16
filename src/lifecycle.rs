//! Leader election and service lifecycle.
//!
//! # Startup
//!
//! 1. Acquire the master mutex
//! 2. Probe the well-known address
//!    - an instance answers: send it `Liveness` and yield
//!    - nothing there: bind the listener and become the server
//!    - busy: release the mutex and retry from step 1 until the busy-wait
//!      bound
//! 3. Release the master mutex
//! 4. Register with the RPC runtime and start listening
//!
//! # Shutdown
//!
//! [`RunningService::run_until_exit`] waits on listener activity and the
//! exit monitor. When the monitor fires, the live flag is cleared, the RPC
//! interface is withdrawn, the listener closes, and in-flight handlers get
//! a bounded time to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::client::send_request;
use crate::config::{deadline_after, ServiceConfig};
use crate::error::{EpmapError, Result};
use crate::monitor::ExitMonitor;
use crate::protocol::Request;
use crate::rpc::{LocalRpcTransport, RpcTransport, EPMAPPER_BINDINGS};
use crate::server::{Listener, ServiceState};
use crate::transport::{probe, ClientStream, MasterMutex, PipeListener, Probe};

/// Interval between election rounds while the address is busy.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Interval between live-handler checks while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a startup attempt.
pub enum Startup {
    /// This process is the server.
    Leader(RunningService),
    /// Another instance is running and has been notified.
    AlreadyRunning,
}

/// Runs the election for one process.
pub struct Coordinator {
    config: ServiceConfig,
    rpc: Arc<dyn RpcTransport>,
}

impl Coordinator {
    pub fn new(config: ServiceConfig, rpc: Arc<dyn RpcTransport>) -> Self {
        Self { config, rpc }
    }

    /// Elect this process as server or notify the running one.
    pub async fn start(&self) -> Result<Startup> {
        let address = self.config.address();
        let master = MasterMutex::new(self.config.lock_path(), self.config.master_mutex_timeout());

        let busy_deadline = deadline_after(self.config.busy_wait_timeout());
        let guard = loop {
            let guard = master.acquire().await.map_err(|e| {
                tracing::error!("Failed to acquire master mutex: {}", e);
                e
            })?;

            let found = probe(&address).await.map_err(|e| {
                tracing::error!(%address, "Failed to probe for a running instance: {}", e);
                e
            })?;
            match found {
                Probe::NotFound => break guard,
                Probe::Connected(stream) => {
                    drop(guard);
                    self.notify_running(stream).await;
                    tracing::info!(%address, "Endpoint mapper already running");
                    return Ok(Startup::AlreadyRunning);
                }
                Probe::Busy => {
                    // The server re-arms under this mutex, so retry without it
                    drop(guard);
                    if Instant::now() >= busy_deadline {
                        tracing::error!(%address, "Endpoint mapper stayed busy");
                        return Err(EpmapError::ServerBusy);
                    }
                    tokio::time::sleep(BUSY_RETRY_INTERVAL).await;
                }
            }
        };

        let listener = PipeListener::bind(&address).await.map_err(|e| {
            tracing::error!(%address, "Failed to create listener: {}", e);
            e
        })?;
        let state = Arc::new(ServiceState::new(&self.config));
        state.set_live(true);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = Listener::new(
            listener,
            Arc::clone(&state),
            master.clone(),
            self.config.max_concurrent_handlers,
            shutdown_rx,
        );
        let listener_task = tokio::spawn(listener.run());
        drop(guard);

        let mut service = RunningService {
            state,
            rpc: Arc::clone(&self.rpc),
            shutdown_tx,
            listener_task: Some(listener_task),
            address,
            drain_timeout: self.config.drain_timeout(),
            rpc_registered: false,
        };

        if let Err(e) = service.register_rpc() {
            tracing::error!("RPC registration failed: {}", e);
            service.shutdown().await;
            return Err(e);
        }

        tracing::info!(address = %service.address, "Endpoint mapper started");
        Ok(Startup::Leader(service))
    }

    async fn notify_running(&self, mut stream: ClientStream) {
        let timeout_ms = u32::try_from(self.config.liveness_timeout_ms).unwrap_or(u32::MAX);
        let request = Request::Liveness { timeout_ms };
        if let Err(e) = send_request(&mut stream, &request, self.config.io_timeout()).await {
            tracing::warn!("Liveness notification failed: {}", e);
        }
    }
}

/// Start with the built-in RPC transport.
pub async fn start(config: ServiceConfig) -> Result<Startup> {
    Coordinator::new(config, Arc::new(LocalRpcTransport::new()))
        .start()
        .await
}

/// A server that won the election.
pub struct RunningService {
    state: Arc<ServiceState>,
    rpc: Arc<dyn RpcTransport>,
    shutdown_tx: watch::Sender<bool>,
    listener_task: Option<JoinHandle<Result<()>>>,
    address: String,
    drain_timeout: Duration,
    rpc_registered: bool,
}

impl RunningService {
    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Serve until `monitor` fires (or the listener fails), then shut down.
    pub async fn run_until_exit(mut self, monitor: &mut dyn ExitMonitor) -> Result<()> {
        let listener_result = loop {
            tokio::select! {
                _ = self.state.activity() => tracing::trace!("Listener activity"),
                _ = monitor.wait() => break None,
                joined = join_listener(&mut self.listener_task) => break Some(joined),
            }
        };

        let outcome = match listener_result {
            None => Ok(()),
            Some(joined) => {
                self.listener_task = None;
                match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        tracing::error!("Listener failed: {}", e);
                        Err(e)
                    }
                    Err(e) => {
                        tracing::error!("Listener task panicked: {}", e);
                        Err(EpmapError::Protocol(format!("listener task failed: {}", e)))
                    }
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Stop accepting, withdraw from the RPC runtime and drain handlers.
    pub async fn shutdown(mut self) {
        self.state.set_live(false);
        let _ = self.shutdown_tx.send(true);

        if self.rpc_registered {
            self.rpc.unregister_interface();
            self.rpc.stop_listening();
            self.rpc_registered = false;
        }

        if let Some(task) = self.listener_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Listener exited with error: {}", e),
                Err(e) => tracing::error!("Listener task panicked: {}", e),
            }
        }

        if !self.drain().await {
            tracing::warn!(
                remaining = self.state.live_handlers(),
                "Drain timeout, exiting with handlers still running"
            );
        }
        tracing::info!(address = %self.address, "Endpoint mapper stopped");
    }

    fn register_rpc(&mut self) -> Result<()> {
        for (protocol_sequence, endpoint) in EPMAPPER_BINDINGS {
            self.rpc
                .register_protocol_and_endpoint(protocol_sequence, endpoint)?;
        }
        self.rpc.register_interface()?;
        self.rpc_registered = true;
        self.rpc.listen()?;
        Ok(())
    }

    /// Wait for in-flight handlers. Returns false on timeout.
    async fn drain(&self) -> bool {
        let deadline = deadline_after(self.drain_timeout);
        while self.state.live_handlers() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }
}

async fn join_listener(
    task: &mut Option<JoinHandle<Result<()>>>,
) -> std::result::Result<Result<()>, JoinError> {
    match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    struct FailingListen;

    impl RpcTransport for FailingListen {
        fn register_protocol_and_endpoint(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn register_interface(&self) -> Result<()> {
            Ok(())
        }
        fn listen(&self) -> Result<()> {
            Err(EpmapError::Rpc("listen refused".to_string()))
        }
        fn unregister_interface(&self) {}
        fn stop_listening(&self) {}
    }

    fn config(dir: &tempfile::TempDir) -> ServiceConfig {
        ServiceConfig::default()
            .with_runtime_dir(dir.path())
            .with_io_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_first_start_becomes_leader() {
        let dir = tempfile::tempdir().unwrap();
        let rpc = Arc::new(LocalRpcTransport::new());
        let coordinator = Coordinator::new(config(&dir), rpc.clone());

        let service = match coordinator.start().await.unwrap() {
            Startup::Leader(service) => service,
            Startup::AlreadyRunning => panic!("expected to become leader"),
        };

        assert!(service.state().is_live());
        assert!(rpc.is_listening());
        assert!(rpc.is_interface_registered());
        assert!(std::path::Path::new(service.address()).exists());

        let address = service.address().to_string();
        service.shutdown().await;
        assert!(!rpc.is_listening());
        assert!(!std::path::Path::new(&address).exists());
    }

    #[tokio::test]
    async fn test_rpc_failure_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let address = config.address();
        let coordinator = Coordinator::new(config, Arc::new(FailingListen));

        let result = coordinator.start().await;

        assert!(matches!(result, Err(EpmapError::Rpc(_))));
        assert!(!std::path::Path::new(&address).exists());
    }

    #[tokio::test]
    async fn test_mutex_timeout_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir).with_master_mutex_timeout(Duration::from_millis(50));
        let held = MasterMutex::new(config.lock_path(), Duration::from_secs(1));
        let _guard = held.acquire().await.unwrap();

        let result = start(config).await;

        assert!(matches!(result, Err(EpmapError::MasterMutexTimeout)));
    }
}
