//! Service configuration.
//!
//! The well-known address and lock names are fixed; only the directory they
//! live in and the timeouts can be tuned. Values come from defaults, or from
//! the JSON file named by `EPMAPD_CONFIG`:
//!
//! ```json
//! { "runtime_dir": "/run/user/1000/epmapd", "idle_timeout_ms": 60000 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::error::Result;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_ENV: &str = "EPMAPD_CONFIG";

/// File name of the Unix domain socket inside the runtime directory.
pub const SOCKET_NAME: &str = "epmap.sock";

/// Well-known named pipe on Windows.
pub const PIPE_NAME: &str = r"\\.\pipe\EpmapNP";

/// File name of the master mutex lock file.
pub const LOCK_NAME: &str = "epmap.lock";

/// Default bounded wait for the master mutex.
pub const DEFAULT_MASTER_MUTEX_TIMEOUT_MS: u64 = 6_000;

/// Default bounded wait while the address exists but is busy.
pub const DEFAULT_BUSY_WAIT_TIMEOUT_MS: u64 = 5_000;

/// Default per-frame I/O timeout on a connection.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;

/// Default idle period before the service exits.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default drain wait for in-flight handlers at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Default maximum concurrent connection handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Configuration for the endpoint mapper service and its clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding the socket and lock file.
    pub runtime_dir: PathBuf,
    pub master_mutex_timeout_ms: u64,
    pub busy_wait_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Idle extension a challenger asks for in its liveness message.
    pub liveness_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub max_concurrent_handlers: usize,
    /// Exit when the parent process exits instead of after an idle period.
    pub exit_with_parent: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            master_mutex_timeout_ms: DEFAULT_MASTER_MUTEX_TIMEOUT_MS,
            busy_wait_timeout_ms: DEFAULT_BUSY_WAIT_TIMEOUT_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            liveness_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            exit_with_parent: false,
        }
    }
}

impl ServiceConfig {
    /// Load from `EPMAPD_CONFIG` if set, otherwise defaults.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = millis(timeout);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = millis(timeout);
        self
    }

    pub fn with_master_mutex_timeout(mut self, timeout: Duration) -> Self {
        self.master_mutex_timeout_ms = millis(timeout);
        self
    }

    pub fn with_max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit;
        self
    }

    /// Address clients connect to.
    pub fn address(&self) -> String {
        #[cfg(unix)]
        {
            self.runtime_dir.join(SOCKET_NAME).to_string_lossy().into_owned()
        }

        #[cfg(windows)]
        {
            PIPE_NAME.to_string()
        }
    }

    /// Path of the master mutex lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join(LOCK_NAME)
    }

    pub fn master_mutex_timeout(&self) -> Duration {
        Duration::from_millis(self.master_mutex_timeout_ms)
    }

    pub fn busy_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_wait_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Horizon used for deadlines too far out for the clock to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline `period` from now, clamped for periods the clock cannot add.
pub(crate) fn deadline_after(period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(period).unwrap_or(now + FAR_FUTURE)
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(unix)]
fn default_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("epmapd"),
        None => {
            // SAFETY: getuid has no preconditions and cannot fail
            let uid = unsafe { libc::getuid() };
            std::env::temp_dir().join(format!("epmapd-{}", uid))
        }
    }
}

#[cfg(windows)]
fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join("epmapd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.master_mutex_timeout(), Duration::from_secs(6));
        assert_eq!(config.max_concurrent_handlers, 256);
        assert!(!config.exit_with_parent);
        assert!(config.lock_path().ends_with(LOCK_NAME));
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            ServiceConfig::from_json(r#"{"runtime_dir": "/tmp/x", "idle_timeout_ms": 100}"#)
                .unwrap();

        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.idle_timeout(), Duration::from_millis(100));
        assert_eq!(config.io_timeout_ms, DEFAULT_IO_TIMEOUT_MS);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(ServiceConfig::from_json("{ nope").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epmapd.json");
        std::fs::write(&path, r#"{"max_concurrent_handlers": 4}"#).unwrap();

        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent_handlers, 4);
    }

    #[test]
    fn test_builder_setters() {
        let config = ServiceConfig::default()
            .with_runtime_dir("/tmp/epmap-test")
            .with_io_timeout(Duration::from_millis(250))
            .with_max_concurrent_handlers(8);

        assert_eq!(config.io_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_concurrent_handlers, 8);
        #[cfg(unix)]
        assert_eq!(config.address(), "/tmp/epmap-test/epmap.sock");
    }

    #[test]
    fn test_setters_saturate_huge_durations() {
        let config = ServiceConfig::default()
            .with_idle_timeout(Duration::MAX)
            .with_io_timeout(Duration::MAX)
            .with_master_mutex_timeout(Duration::MAX);

        assert_eq!(config.idle_timeout_ms, u64::MAX);
        assert_eq!(config.io_timeout_ms, u64::MAX);
        assert_eq!(config.master_mutex_timeout_ms, u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_clamps_overflow() {
        let now = Instant::now();

        assert_eq!(deadline_after(Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(deadline_after(Duration::MAX) >= now + FAR_FUTURE);
        assert!(deadline_after(Duration::from_millis(u64::MAX)) > now);
    }
}
