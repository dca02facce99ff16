//! Control plane: one JSON status line on stdout.
//!
//! Whoever launched the service lazily can read a single line from stdout to
//! learn whether this process became the server and where it listens. Logs
//! never go to stdout.
//!
//! ```
//! use epmapd::control::{build_status_line, StatusEvent};
//!
//! let line = build_status_line(&StatusEvent::ready("/run/epmapd/epmap.sock")).unwrap();
//! assert!(line.contains(r#""event":"ready""#));
//! ```

mod status;
mod stdio;

pub use status::{announce, announce_to, build_status_line, StatusEvent};
pub use stdio::write_line;
