//! Per-connection request handling.
//!
//! A connection carries exactly one request:
//! 1. Read the header frame
//! 2. Read `ceil(payload_size / CHUNK_SIZE)` chunk frames
//! 3. Decode and dispatch under the map lock
//! 4. Write one reply frame and close
//!
//! Any failure (short read, bad tag, oversize payload, timeout) closes the
//! connection without a reply and leaves the map untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;

use super::state::ServiceState;
use crate::error::{EpmapError, Result};
use crate::protocol::{
    ChunkAssembler, FrameHeader, MessageType, Request, MAX_PAYLOAD_SIZE, MESSAGE_SIZE,
};

/// Read, execute and answer the single request on `stream`.
pub async fn handle_connection<S>(mut stream: S, state: &ServiceState) -> Result<MessageType>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io_timeout = state.io_timeout();

    let mut frame = [0u8; MESSAGE_SIZE];
    read_frame(&mut stream, &mut frame, io_timeout).await?;

    let header = FrameHeader::decode(&frame)?;
    if header.message_type == MessageType::PayloadChunk {
        return Err(EpmapError::Protocol(
            "Connection opened with a payload chunk".to_string(),
        ));
    }
    header.validate(MAX_PAYLOAD_SIZE)?;

    let mut assembler = ChunkAssembler::new(header.payload_size, MAX_PAYLOAD_SIZE)?;
    let mut chunk = [0u8; MESSAGE_SIZE];
    while !assembler.is_complete() {
        read_frame(&mut stream, &mut chunk, io_timeout).await?;
        assembler.push(&chunk)?;
    }
    let payload = assembler.finish()?;

    let request = Request::decode(&frame, &payload)?;
    let reply = state.dispatch(&request);

    let reply_frame = reply.encode();
    with_timeout(io_timeout, "reply", stream.write_all(&reply_frame)).await?;
    with_timeout(io_timeout, "reply", stream.flush()).await?;
    // Peer may already be gone once it has its reply
    let _ = stream.shutdown().await;

    Ok(header.message_type)
}

/// Run [`handle_connection`] as a counted task holding a handler permit.
pub(crate) fn spawn_handler<S>(stream: S, state: Arc<ServiceState>, permit: OwnedSemaphorePermit)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let guard = state.handler_started();
    tokio::spawn(async move {
        // Permit and counter are held until this task completes
        let _permit = permit;
        let _guard = guard;

        match handle_connection(stream, &state).await {
            Ok(message_type) => tracing::debug!("Handled {:?} request", message_type),
            Err(EpmapError::ConnectionClosed) => {
                tracing::debug!("Client closed connection before a full request")
            }
            Err(e) => tracing::warn!("Dropping connection: {}", e),
        }
    });
}

async fn read_frame<S>(stream: &mut S, buf: &mut [u8], timeout: Duration) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, stream.read_exact(buf)).await {
        Err(_) => Err(EpmapError::Timeout("frame read")),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(EpmapError::ConnectionClosed)
        }
        Ok(Err(e)) => Err(EpmapError::Io(e)),
        Ok(Ok(_)) => Ok(()),
    }
}

async fn with_timeout<F, T>(timeout: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Err(_) => Err(EpmapError::Timeout(what)),
        Ok(result) => Ok(result?),
    }
}
