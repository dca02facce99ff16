//! Stdout writer for the control plane.
//!
//! stdout carries exactly the status line; logs go to stderr. Lines end
//! with a bare `\n` on every platform, so `println!` is not used.

use std::io::Write;

/// Write `line` plus `\n` to `out` and flush.
pub fn write_line<W: Write>(mut out: W, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()
}
