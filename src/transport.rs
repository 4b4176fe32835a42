//! Transport layer for connection communication
//!
//! This module provides the stream abstraction a [`Connection`](crate::Connection)
//! is built on, with separate implementations for TCP and in-process peers.
//!
//! The transport layer is organized into:
//! - `codec`: NDJSON framing for messages
//! - `tcp`: Tokio-based TCP connector
//! - `memory`: In-process duplex connector

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod codec;
mod memory;
mod tcp;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_LEN, JsonLineCodec};
pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use tcp::TcpConnector;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport connection error: {0}")]
    Connection(String),
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte stream, split into independently owned halves.
///
/// Dropping both halves closes the underlying stream.
pub struct TransportStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl TransportStream {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Opens transport streams to a `(host, port)` endpoint.
///
/// A connection calls [`open`](Connector::open) once per attempt and owns the
/// returned stream exclusively. Timeouts are applied by the caller, so
/// implementations may wait as long as the underlying transport does.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, host: &str, port: u16) -> Result<TransportStream, TransportError>;
}
