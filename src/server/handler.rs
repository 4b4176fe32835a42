//! Connection handling
//!
//! This module handles individual peer connections for the echo server.

use crate::transport::{CodecError, JsonLineCodec, TransportError};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::ServerInner;

type ServerResult<T> = std::result::Result<T, TransportError>;

pub(super) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    inner: Arc<ServerInner>,
) -> ServerResult<()> {
    let active = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
    inner.served.fetch_add(1, Ordering::SeqCst);
    log::info!("Peer {} connected ({} active)", addr, active);

    let result = echo_frames(stream, addr, &inner).await;

    let active = inner.active.fetch_sub(1, Ordering::SeqCst) - 1;
    log::info!("Peer {} disconnected ({} active)", addr, active);

    result
}

async fn echo_frames(stream: TcpStream, addr: SocketAddr, inner: &ServerInner) -> ServerResult<()> {
    let mut frames = Framed::new(stream, JsonLineCodec::<Value>::new(inner.max_frame_len));

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(CodecError::Io(e)) => return Err(TransportError::Io(e)),
            Err(e) => {
                // Same contract as the client: a bad frame ends reading
                log::warn!("Dropping peer {}: {}", addr, e);
                return Ok(());
            }
        };

        log::debug!("Echoing frame from {}: {}", addr, message);
        frames.send(message).await.map_err(|e| match e {
            CodecError::Io(e) => TransportError::Io(e),
            other => TransportError::Connection(other.to_string()),
        })?;
    }

    Ok(())
}
