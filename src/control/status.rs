//! Status messages.

use std::io::Write;

use serde::Serialize;

use super::stdio::write_line;
use crate::error::Result;

/// Outcome of startup, as reported on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// This process won the election and is listening.
    Ready { address: String, pid: u32 },
    /// Another instance answered; this process notified it and is exiting.
    AlreadyRunning { address: String },
}

impl StatusEvent {
    pub fn ready(address: impl Into<String>) -> Self {
        StatusEvent::Ready {
            address: address.into(),
            pid: std::process::id(),
        }
    }

    pub fn already_running(address: impl Into<String>) -> Self {
        StatusEvent::AlreadyRunning {
            address: address.into(),
        }
    }
}

/// Serialize a status event to a single JSON line (without the newline).
pub fn build_status_line(event: &StatusEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// Write the status line for `event` to `out`.
///
/// A reader that went away is not fatal to the service, so failures are
/// logged and reported as `false` instead of propagated.
pub fn announce_to<W: Write>(out: W, event: &StatusEvent) -> bool {
    let written = build_status_line(event).and_then(|line| Ok(write_line(out, &line)?));
    match written {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to write status line: {}", e);
            false
        }
    }
}

/// Write the status line for `event` to stdout. See [`announce_to`].
pub fn announce(event: &StatusEvent) -> bool {
    announce_to(std::io::stdout().lock(), event)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn test_ready_line() {
        let line = build_status_line(&StatusEvent::Ready {
            address: "/tmp/epmap.sock".to_string(),
            pid: 42,
        })
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "ready");
        assert_eq!(value["address"], "/tmp/epmap.sock");
        assert_eq!(value["pid"], 42);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_already_running_line() {
        let line = build_status_line(&StatusEvent::already_running(r"\\.\pipe\EpmapNP")).unwrap();

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "already_running");
        assert_eq!(value["address"], r"\\.\pipe\EpmapNP");
        assert!(value.get("pid").is_none());
    }

    #[test]
    fn test_announce_writes_one_line() {
        let mut out = Vec::new();
        assert!(announce_to(&mut out, &StatusEvent::already_running("/tmp/x.sock")));

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains(r#""event":"already_running""#));
    }

    #[test]
    fn test_announce_to_closed_reader_is_not_fatal() {
        assert!(!announce_to(ClosedPipe, &StatusEvent::ready("/tmp/x.sock")));
    }
}
