//! Endpoint mapper client.
//!
//! Each call opens its own connection, sends one request and reads one
//! reply, matching the server's one-request-per-connection model.
//!
//! # Example
//!
//! ```no_run
//! use epmapd::{EpmapClient, InterfaceId, ObjectId, ServiceConfig};
//! use epmapd::protocol::bindings;
//! use uuid::Uuid;
//!
//! # async fn run() -> epmapd::Result<()> {
//! let client = EpmapClient::new(&ServiceConfig::load()?);
//! let iface = InterfaceId::new(Uuid::from_u128(0x1234), 1, 0);
//!
//! client
//!     .register(&iface, &[], bindings([("ncacn_np", r"\pipe\svc")]), false)
//!     .await?;
//! let endpoint = client.resolve(&iface, &ObjectId::NIL, "ncacn_np").await?;
//! assert_eq!(endpoint.as_deref(), Some(r"\pipe\svc"));
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ServiceConfig;
use crate::error::{EpmapError, Result};
use crate::map::{InterfaceId, ObjectId};
use crate::protocol::{Binding, Reply, Request, TrailingPayload, REPLY_SIZE};
use crate::transport::connect;

/// Client for a running endpoint mapper.
#[derive(Debug, Clone)]
pub struct EpmapClient {
    address: String,
    busy_timeout: Duration,
    io_timeout: Duration,
}

impl EpmapClient {
    /// Client for the address and timeouts in `config`.
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            address: config.address(),
            busy_timeout: config.busy_wait_timeout(),
            io_timeout: config.io_timeout(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register `bindings` for `iface` and each of `objects` (or the wildcard).
    pub async fn register(
        &self,
        iface: &InterfaceId,
        objects: &[ObjectId],
        bindings: Vec<Binding>,
        no_replace: bool,
    ) -> Result<u32> {
        let request = Request::RegisterEndpoints {
            iface: *iface,
            payload: TrailingPayload::new(objects.to_vec(), bindings),
            no_replace,
        };
        self.call_status(&request).await
    }

    /// Remove every entry matching the bindings' protocol sequences.
    pub async fn unregister(
        &self,
        iface: &InterfaceId,
        objects: &[ObjectId],
        bindings: Vec<Binding>,
    ) -> Result<u32> {
        let request = Request::UnregisterEndpoints {
            iface: *iface,
            payload: TrailingPayload::new(objects.to_vec(), bindings),
        };
        self.call_status(&request).await
    }

    /// Look up an endpoint. `Ok(None)` if nothing is registered.
    pub async fn resolve(
        &self,
        iface: &InterfaceId,
        object: &ObjectId,
        protocol_sequence: &str,
    ) -> Result<Option<String>> {
        let request = Request::ResolveEndpoint {
            iface: *iface,
            object: *object,
            protocol_sequence: protocol_sequence.to_string(),
        };
        match self.call(&request).await? {
            Reply::Endpoint(endpoint) => Ok(endpoint),
            Reply::Status(status) => Err(EpmapError::Rpc(format!(
                "Unexpected status {} for resolve",
                status
            ))),
        }
    }

    /// Ask the server to stay up for at least `timeout`.
    pub async fn liveness(&self, timeout: Duration) -> Result<u32> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.call_status(&Request::Liveness { timeout_ms }).await
    }

    /// Send any request on a fresh connection.
    pub async fn call(&self, request: &Request) -> Result<Reply> {
        let mut stream = connect(&self.address, self.busy_timeout).await?;
        send_request(&mut stream, request, self.io_timeout).await
    }

    async fn call_status(&self, request: &Request) -> Result<u32> {
        match self.call(request).await? {
            Reply::Status(status) => Ok(status),
            Reply::Endpoint(_) => Err(EpmapError::Rpc(
                "Unexpected endpoint reply to a status request".to_string(),
            )),
        }
    }
}

/// Write `request` on `stream` and read its reply.
pub async fn send_request<S>(stream: &mut S, request: &Request, io_timeout: Duration) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = request.encode_bytes()?;

    tokio::time::timeout(io_timeout, stream.write_all(&bytes))
        .await
        .map_err(|_| EpmapError::Timeout("request write"))??;
    tokio::time::timeout(io_timeout, stream.flush())
        .await
        .map_err(|_| EpmapError::Timeout("request write"))??;

    let mut frame = [0u8; REPLY_SIZE];
    match tokio::time::timeout(io_timeout, stream.read_exact(&mut frame)).await {
        Err(_) => return Err(EpmapError::Timeout("reply read")),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(EpmapError::ConnectionClosed)
        }
        Ok(Err(e)) => return Err(EpmapError::Io(e)),
        Ok(Ok(_)) => {}
    }

    Reply::decode(&frame, request.message_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, MESSAGE_SIZE};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_send_request_reads_reply() {
        let (mut client, mut server) = duplex(8 * 1024);

        let server_task = tokio::spawn(async move {
            let mut frame = [0u8; MESSAGE_SIZE];
            server.read_exact(&mut frame).await.unwrap();
            let request = Request::decode(&frame, &[]).unwrap();
            assert_eq!(request, Request::Liveness { timeout_ms: 1500 });
            server.write_all(&Reply::ok().encode()).await.unwrap();
        });

        let reply = send_request(
            &mut client,
            &Request::Liveness { timeout_ms: 1500 },
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(reply, Reply::ok());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_request_without_reply() {
        let (mut client, mut server) = duplex(8 * 1024);

        tokio::spawn(async move {
            let mut frame = [0u8; MESSAGE_SIZE];
            let _ = server.read_exact(&mut frame).await;
            // closed without answering
        });

        let result = send_request(
            &mut client,
            &Request::Liveness { timeout_ms: 0 },
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(EpmapError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_reply_decoded_per_request_type() {
        let (mut client, mut server) = duplex(8 * 1024);
        let request = Request::ResolveEndpoint {
            iface: InterfaceId::new(uuid::Uuid::nil(), 0, 0),
            object: ObjectId::NIL,
            protocol_sequence: "ncalrpc".to_string(),
        };
        assert_eq!(request.message_type(), MessageType::ResolveEndpoint);

        tokio::spawn(async move {
            let mut frame = [0u8; MESSAGE_SIZE];
            server.read_exact(&mut frame).await.unwrap();
            server
                .write_all(&Reply::Endpoint(None).encode())
                .await
                .unwrap();
        });

        let reply = send_request(&mut client, &request, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Endpoint(None));
    }
}
