//! Platform-specific well-known address.
//!
//! - Unix: Unix Domain Socket inside the runtime directory
//! - Windows: Named Pipe
//!
//! Named pipes consume one server instance per accepted client, so the
//! listener API splits accepting into two steps: [`PipeListener::accept`]
//! waits for a client, and [`PipeListener::rearm`] puts a fresh instance in
//! place and hands back the connected stream. On Unix `rearm` only unwraps
//! the accepted socket.
//!
//! # Example
//!
//! ```ignore
//! use epmapd::transport::PipeListener;
//!
//! let mut listener = PipeListener::bind(&address).await?;
//! let pending = listener.accept().await?;
//! let stream = listener.rearm(pending)?;
//! ```

use crate::config::deadline_after;
use crate::error::{EpmapError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

/// Interval between connection attempts while the address is busy.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of a single connection attempt to the well-known address.
pub enum Probe {
    /// A server answered.
    Connected(ClientStream),
    /// Nobody is serving the address.
    NotFound,
    /// The address exists but cannot take a client right now.
    Busy,
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::io::ErrorKind;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener.
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    /// A client accepted but not yet handed off.
    pub struct Pending {
        stream: UnixStream,
    }

    /// Unix Domain Socket stream (connected).
    pub struct PipeStream {
        stream: UnixStream,
    }

    /// Client side of a connection.
    pub type ClientStream = PipeStream;

    impl PipeListener {
        /// Bind to a Unix socket path.
        ///
        /// Removes any existing socket file at the path before binding. The
        /// caller must hold the master mutex and have probed the address.
        pub async fn bind(path: &str) -> Result<Self> {
            let socket = Path::new(path);
            if let Some(dir) = socket.parent() {
                std::fs::create_dir_all(dir)?;
            }

            // Stale socket from a server that died without cleaning up
            if socket.exists() {
                std::fs::remove_file(socket)?;
            }

            let listener = UnixListener::bind(path)?;

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Wait for the next client.
        pub async fn accept(&mut self) -> Result<Pending> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(Pending { stream })
        }

        /// Hand off an accepted client. The socket keeps listening by itself.
        pub fn rearm(&mut self, pending: Pending) -> Result<PipeStream> {
            Ok(PipeStream {
                stream: pending.stream,
            })
        }

        /// Get the socket path.
        pub fn address(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            // Clean up socket file when listener is dropped
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Try once to connect to the address.
    ///
    /// A socket file nobody listens on is reported as `NotFound`; the next
    /// server replaces it.
    pub async fn probe(path: &str) -> Result<Probe> {
        match UnixStream::connect(path).await {
            Ok(stream) => Ok(Probe::Connected(PipeStream { stream })),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                Ok(Probe::NotFound)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Probe::Busy),
            Err(e) => Err(EpmapError::Io(e)),
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };
    use windows_sys::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_PIPE_BUSY};

    /// Windows Named Pipe listener.
    ///
    /// Always owns exactly one unconnected instance between accepts.
    pub struct PipeListener {
        path: String,
        instance: NamedPipeServer,
    }

    /// Marker for a connected instance still owned by the listener.
    pub struct Pending {
        _connected: (),
    }

    /// Windows Named Pipe stream (server side, connected).
    pub struct PipeStream {
        pipe: NamedPipeServer,
    }

    /// Windows Named Pipe stream (client side).
    pub struct ClientStream {
        pipe: NamedPipeClient,
    }

    impl PipeListener {
        /// Create the first instance of the pipe.
        ///
        /// Fails if any other process already owns an instance of this name.
        pub async fn bind(path: &str) -> Result<Self> {
            let instance = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)
                .map_err(EpmapError::Io)?;

            Ok(Self {
                path: path.to_string(),
                instance,
            })
        }

        /// Wait for a client to connect to the current instance.
        pub async fn accept(&mut self) -> Result<Pending> {
            self.instance.connect().await?;
            Ok(Pending { _connected: () })
        }

        /// Create a fresh instance and hand off the connected one.
        pub fn rearm(&mut self, _pending: Pending) -> Result<PipeStream> {
            let next = ServerOptions::new()
                .first_pipe_instance(false)
                .create(&self.path)
                .map_err(EpmapError::Io)?;

            let pipe = std::mem::replace(&mut self.instance, next);
            Ok(PipeStream { pipe })
        }

        /// Get the pipe path.
        pub fn address(&self) -> &str {
            &self.path
        }
    }

    /// Try once to open the pipe.
    pub async fn probe(path: &str) -> Result<Probe> {
        match ClientOptions::new().open(path) {
            Ok(pipe) => Ok(Probe::Connected(ClientStream { pipe })),
            Err(e) if e.raw_os_error() == Some(ERROR_FILE_NOT_FOUND as i32) => Ok(Probe::NotFound),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => Ok(Probe::Busy),
            Err(e) => Err(EpmapError::Io(e)),
        }
    }

    macro_rules! forward_io {
        ($ty:ty, $field:ident) => {
            impl AsyncRead for $ty {
                fn poll_read(
                    mut self: std::pin::Pin<&mut Self>,
                    cx: &mut std::task::Context<'_>,
                    buf: &mut tokio::io::ReadBuf<'_>,
                ) -> std::task::Poll<std::io::Result<()>> {
                    std::pin::Pin::new(&mut self.$field).poll_read(cx, buf)
                }
            }

            impl AsyncWrite for $ty {
                fn poll_write(
                    mut self: std::pin::Pin<&mut Self>,
                    cx: &mut std::task::Context<'_>,
                    buf: &[u8],
                ) -> std::task::Poll<std::io::Result<usize>> {
                    std::pin::Pin::new(&mut self.$field).poll_write(cx, buf)
                }

                fn poll_flush(
                    mut self: std::pin::Pin<&mut Self>,
                    cx: &mut std::task::Context<'_>,
                ) -> std::task::Poll<std::io::Result<()>> {
                    std::pin::Pin::new(&mut self.$field).poll_flush(cx)
                }

                fn poll_shutdown(
                    mut self: std::pin::Pin<&mut Self>,
                    cx: &mut std::task::Context<'_>,
                ) -> std::task::Poll<std::io::Result<()>> {
                    std::pin::Pin::new(&mut self.$field).poll_shutdown(cx)
                }
            }
        };
    }

    forward_io!(PipeStream, pipe);
    forward_io!(ClientStream, pipe);
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{probe, ClientStream, Pending, PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{probe, ClientStream, Pending, PipeListener, PipeStream};

/// Connect to a running server, retrying while the address is busy.
///
/// Fails with `NotFound` if no server exists and with
/// [`EpmapError::ServerBusy`] if it stayed busy for `busy_timeout`.
pub async fn connect(address: &str, busy_timeout: Duration) -> Result<ClientStream> {
    let deadline = deadline_after(busy_timeout);
    loop {
        match probe(address).await? {
            Probe::Connected(stream) => return Ok(stream),
            Probe::NotFound => {
                return Err(EpmapError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no endpoint mapper at {}", address),
                )))
            }
            Probe::Busy => {
                if Instant::now() >= deadline {
                    return Err(EpmapError::ServerBusy);
                }
                tokio::time::sleep(BUSY_RETRY_INTERVAL).await;
            }
        }
    }
}
