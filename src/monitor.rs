//! Exit monitors.
//!
//! The coordinator's main wait returns once its [`ExitMonitor`] fires.
//! [`IdleExit`] fires when the idle deadline passes without accepts or
//! liveness notifications. [`ProcessExit`] (Unix) fires when every watched
//! process has exited. [`SignalExit`] adds termination signals to either.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::server::ServiceState;

/// Boxed future type for exit monitors.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A signal telling the service it may exit.
pub trait ExitMonitor: Send {
    /// Complete once the service should shut down.
    fn wait(&mut self) -> BoxFuture<'_, ()>;
}

/// Fires once the service's idle deadline has passed.
///
/// The deadline moves forward on every accepted connection and on every
/// `Liveness` request, so the wait re-arms itself until it observes a
/// deadline that is already behind it.
pub struct IdleExit {
    state: Arc<ServiceState>,
}

impl IdleExit {
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self { state }
    }
}

impl ExitMonitor for IdleExit {
    fn wait(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let deadline = self.state.idle().deadline();
                if tokio::time::Instant::now() >= deadline {
                    tracing::info!("Idle deadline reached");
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        })
    }
}

/// Default polling interval for [`ProcessExit`].
#[cfg(unix)]
pub const DEFAULT_PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fires once every watched process has exited.
#[cfg(unix)]
pub struct ProcessExit {
    pids: Vec<u32>,
    interval: Duration,
}

#[cfg(unix)]
impl ProcessExit {
    pub fn new(pids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            pids: pids.into_iter().collect(),
            interval: DEFAULT_PROCESS_POLL_INTERVAL,
        }
    }

    /// Watch the process that started this one.
    pub fn parent() -> Self {
        // SAFETY: getppid has no preconditions and cannot fail
        let ppid = unsafe { libc::getppid() };
        Self::new([ppid as u32])
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn watched(&self) -> &[u32] {
        &self.pids
    }
}

#[cfg(unix)]
impl ExitMonitor for ProcessExit {
    fn wait(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                self.pids.retain(|&pid| process_alive(pid));
                if self.pids.is_empty() {
                    tracing::info!("All watched processes have exited");
                    return;
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Wraps another monitor and also fires on SIGTERM/SIGINT (Ctrl+C on Windows).
pub struct SignalExit<M> {
    inner: M,
}

impl<M: ExitMonitor> SignalExit<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<M: ExitMonitor> ExitMonitor for SignalExit<M> {
    fn wait(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tokio::select! {
                _ = self.inner.wait() => {}
                _ = shutdown_signal() => {}
            }
        })
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to install signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
    }
}

#[cfg(windows)]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        return std::future::pending().await;
    }
    tracing::info!("Ctrl+C received, shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::protocol::Request;

    fn state(idle: Duration) -> Arc<ServiceState> {
        Arc::new(ServiceState::new(
            &ServiceConfig::default().with_idle_timeout(idle),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_exit_fires_after_timeout() {
        let state = state(Duration::from_secs(30));
        let mut monitor = IdleExit::new(state);

        let start = tokio::time::Instant::now();
        monitor.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_postpones_idle_exit() {
        let state = state(Duration::from_secs(30));
        let mut monitor = IdleExit::new(Arc::clone(&state));
        let start = tokio::time::Instant::now();

        let waiter = tokio::spawn(async move { monitor.wait().await });
        tokio::time::sleep(Duration::from_secs(20)).await;
        state.dispatch(&Request::Liveness { timeout_ms: 60_000 });

        waiter.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_exit_forwards_inner() {
        let state = state(Duration::from_secs(5));
        let mut monitor = SignalExit::new(IdleExit::new(state));

        let start = tokio::time::Instant::now();
        monitor.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_with_dead_pid() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut monitor = ProcessExit::new([pid]).with_interval(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(2), monitor.wait())
            .await
            .unwrap();
        assert!(monitor.watched().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_waits_for_live_pid() {
        let mut monitor =
            ProcessExit::new([std::process::id()]).with_interval(Duration::from_millis(10));

        let result = tokio::time::timeout(Duration::from_millis(50), monitor.wait()).await;
        assert!(result.is_err());
    }
}
