//! Accept loop.
//!
//! Each accepted connection is re-armed under the master mutex before its
//! handler is spawned, so a challenger probing the address either connects
//! to a live instance or observes it as busy, never as absent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};

use super::handler::spawn_handler;
use super::state::ServiceState;
use crate::error::Result;
use crate::transport::{MasterMutex, PipeListener};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Owns the listening endpoint and hands connections to handlers.
pub struct Listener {
    listener: PipeListener,
    state: Arc<ServiceState>,
    master: MasterMutex,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(
        listener: PipeListener,
        state: Arc<ServiceState>,
        master: MasterMutex,
        max_concurrent_handlers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            state,
            master,
            semaphore: Arc::new(Semaphore::new(max_concurrent_handlers)),
            shutdown,
        }
    }

    /// Accept until shutdown is signalled. The endpoint closes on return.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(address = %self.listener.address(), "Listening");

        while self.state.is_live() {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.changed() => break,
            };

            let pending = match accepted {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            self.state.record_activity();

            let stream = {
                let _guard = match self.master.acquire().await {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        tracing::warn!("Re-arming without master mutex: {}", e);
                        None
                    }
                };
                self.listener.rearm(pending)?
            };

            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => spawn_handler(stream, Arc::clone(&self.state), permit),
                Err(_) => tracing::warn!("Handler capacity reached, dropping connection"),
            }
        }

        tracing::info!(address = %self.listener.address(), "Listener stopped");
        Ok(())
    }
}
