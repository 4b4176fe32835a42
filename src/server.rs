//! Line-framed JSON echo server
//!
//! This module provides a peer that accepts TCP connections and writes every
//! frame it receives straight back. It is what `connkit serve` runs and what
//! the end-to-end tests connect to.

mod handler;

use crate::transport::TransportError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Notify;

use handler::handle_connection;

type ServerResult<T> = std::result::Result<T, TransportError>;

pub struct EchoServer {
    inner: Arc<ServerInner>,
    listener: TcpListener,
}

impl EchoServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, max_frame_len: usize) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::Connection(
                    "Address already in use. Is another server running?".to_string(),
                )
            } else {
                TransportError::Connection(format!("Failed to bind listener: {}", e))
            }
        })?;

        let inner = Arc::new(ServerInner::new(max_frame_len));

        Ok(Self { inner, listener })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops [`run`](Self::run) when notified
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub async fn run(&self) -> ServerResult<()> {
        log::info!("Echo server listening on {}", self.local_addr()?);

        tokio::select! {
            _ = self.inner.shutdown_notify.notified() => {
                log::info!(
                    "Shutdown signal received after {}s, served {} connections",
                    self.inner.start_time.elapsed().as_secs(),
                    self.inner.served.load(Ordering::SeqCst)
                );
                Ok(())
            }
            result = self.accept_loop() => result,
        }
    }

    async fn accept_loop(&self) -> ServerResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, inner).await {
                            log::warn!("Error handling connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ServerInner>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.inner.shutdown_notify.notify_one();
    }
}

/// Shared server state
struct ServerInner {
    pub max_frame_len: usize,
    pub start_time: Instant,
    pub active: AtomicUsize,
    pub served: AtomicU64,
    pub shutdown_notify: Notify,
}

impl ServerInner {
    fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            start_time: Instant::now(),
            active: AtomicUsize::new(0),
            served: AtomicU64::new(0),
            shutdown_notify: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::config::ConnectionConfig;
    use crate::connection::{Connection, ConnectionEvent, DisconnectReason, Events};
    use crate::transport::DEFAULT_MAX_FRAME_LEN;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event<M>(events: &mut Events<M>) -> ConnectionEvent<M> {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream closed")
    }

    async fn start_server() -> (SocketAddr, ShutdownHandle) {
        let server = EchoServer::bind("127.0.0.1:0", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move { server.run().await });
        (addr, shutdown)
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    #[serde(tag = "type", rename_all = "lowercase")]
    enum Chat {
        Hello { id: u32, name: String },
        Say { id: u32, text: String },
    }

    #[tokio::test]
    async fn test_round_trip_through_echo_server() {
        let (addr, shutdown) = start_server().await;
        let config = ConnectionConfig::default().with_reconnect(ReconnectPolicy::disabled());
        let (conn, mut events) = Connection::<Chat>::new("127.0.0.1", addr.port(), config);

        conn.connect();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        let messages = vec![
            Chat::Hello {
                id: 1,
                name: "ada".to_string(),
            },
            Chat::Say {
                id: 2,
                text: "line one\nline two".to_string(),
            },
        ];
        for message in &messages {
            conn.send(message.clone());
        }
        for message in messages {
            assert_eq!(
                next_event(&mut events).await,
                ConnectionEvent::Received(message)
            );
        }

        conn.disconnect();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(DisconnectReason::ExplicitClose)
        );
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnection_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"{\"id\":1}\n").await.unwrap();
            stream.flush().await.unwrap();
        });

        let config = ConnectionConfig::default().with_reconnect(ReconnectPolicy::disabled());
        let (conn, mut events) = Connection::<Value>::new("localhost", port, config);
        conn.connect();

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Received(json!({"id": 1}))
        );
        peer.await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(DisconnectReason::PeerClosed)
        );

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Error(crate::ConnectionError::RetriesExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let (addr, _shutdown) = start_server().await;
        let result = EchoServer::bind(addr, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
