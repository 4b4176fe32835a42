//! In-process transport built on tokio duplex pipes
//!
//! Every successful [`open`](Connector::open) hands the far end of a fresh
//! pipe to the paired [`MemoryListener`], which plays the peer.

use super::{Connector, TransportError, TransportStream};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Connector half of an in-process transport
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    capacity: usize,
    refusals: AtomicU32,
    opens: AtomicUsize,
}

/// Peer half of an in-process transport
pub struct MemoryListener {
    peers: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

/// The peer's end of one opened stream
#[derive(Debug)]
pub struct MemoryPeer {
    pub host: String,
    pub port: u16,
    pub stream: DuplexStream,
}

impl MemoryConnector {
    /// Create a connector and the listener that receives its peers
    pub fn pair() -> (Self, MemoryListener) {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Like [`pair`](Self::pair), with a fixed pipe buffer size in bytes
    pub fn with_capacity(capacity: usize) -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers: tx,
            capacity,
            refusals: AtomicU32::new(0),
            opens: AtomicUsize::new(0),
        };
        let listener = MemoryListener {
            peers: Mutex::new(rx),
        };
        (connector, listener)
    }

    /// Refuse the next `count` open attempts
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Number of open attempts seen, refused or not
    pub fn open_attempts(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, host: &str, port: u16) -> Result<TransportStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connection(format!(
                "Connection refused by {}:{}",
                host, port
            )));
        }

        let (local, remote) = tokio::io::duplex(self.capacity);
        let peer = MemoryPeer {
            host: host.to_string(),
            port,
            stream: remote,
        };
        self.peers.send(peer).map_err(|_| {
            TransportError::Connection(format!("No listener for {}:{}", host, port))
        })?;

        let (reader, writer) = tokio::io::split(local);
        Ok(TransportStream::new(reader, writer))
    }
}

impl MemoryListener {
    /// Wait for the next opened stream; `None` once the connector is gone
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_hands_peer_to_listener() {
        let (connector, listener) = MemoryConnector::pair();
        let mut stream = connector.open("localhost", 9000).await.unwrap();

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.host, "localhost");
        assert_eq!(peer.port, 9000);

        stream.writer.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        peer.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");
    }

    #[tokio::test]
    async fn test_refuse_next() {
        let (connector, listener) = MemoryConnector::pair();
        connector.refuse_next(2);

        assert!(connector.open("localhost", 1).await.is_err());
        assert!(connector.open("localhost", 1).await.is_err());
        assert!(connector.open("localhost", 1).await.is_ok());
        assert_eq!(connector.open_attempts(), 3);
        assert!(listener.accept().await.is_some());
    }

    #[tokio::test]
    async fn test_open_fails_without_listener() {
        let (connector, listener) = MemoryConnector::pair();
        drop(listener);
        assert!(connector.open("localhost", 1).await.is_err());
    }
}
