//! epmapd binary.
//!
//! Started lazily by whatever first needs the endpoint mapper. Either wins
//! the election and serves until its exit monitor fires, or notifies the
//! running instance and exits immediately. Logs go to stderr, the startup
//! status line to stdout.

use std::process::ExitCode;

use epmapd::control::{announce, StatusEvent};
use epmapd::lifecycle::{self, Startup};
use epmapd::monitor::{ExitMonitor, IdleExit, SignalExit};
use epmapd::{Result, ServiceConfig};

fn main() -> ExitCode {
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("epmapd failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = ServiceConfig::load()?;
    tracing::debug!(?config, "Configuration loaded");
    let exit_with_parent = config.exit_with_parent;
    let address = config.address();

    let service = match lifecycle::start(config).await? {
        Startup::Leader(service) => service,
        Startup::AlreadyRunning => {
            announce(&StatusEvent::already_running(address));
            return Ok(());
        }
    };

    // A closed stdout must not skip the teardown in run_until_exit
    announce(&StatusEvent::ready(service.address()));

    let mut monitor = exit_monitor(&service, exit_with_parent);
    service.run_until_exit(monitor.as_mut()).await
}

#[cfg(unix)]
fn exit_monitor(service: &lifecycle::RunningService, exit_with_parent: bool) -> Box<dyn ExitMonitor> {
    use epmapd::monitor::ProcessExit;

    if exit_with_parent {
        Box::new(SignalExit::new(ProcessExit::parent()))
    } else {
        Box::new(SignalExit::new(IdleExit::new(service.state().clone())))
    }
}

#[cfg(windows)]
fn exit_monitor(service: &lifecycle::RunningService, exit_with_parent: bool) -> Box<dyn ExitMonitor> {
    if exit_with_parent {
        tracing::warn!("exit_with_parent is not supported on Windows, using idle exit");
    }
    Box::new(SignalExit::new(IdleExit::new(service.state().clone())))
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,epmapd=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
}
