//! Persistent line-delimited JSON connection
//!
//! A [`Connection`] is a handle to a driver task that owns one transport
//! stream at a time. Every operation on the handle is a non-blocking request;
//! outcomes are reported on the [`Events`] stream returned alongside it.
//!
//! ```no_run
//! # async fn demo() {
//! use connkit::{Connection, ConnectionConfig, ConnectionEvent};
//! use serde_json::{Value, json};
//!
//! let (conn, mut events) = Connection::<Value>::new("localhost", 9000, ConnectionConfig::default());
//! conn.connect();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ConnectionEvent::Connected => conn.send(json!({"id": 1})),
//!         ConnectionEvent::Received(message) => println!("{}", message),
//!         other => eprintln!("{:?}", other),
//!     }
//! }
//! # }
//! ```

mod driver;
mod state;

pub use state::ConnectionState;

use crate::config::ConnectionConfig;
use crate::transport::{Connector, TcpConnector};
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use driver::{Command, Driver};

/// Values that can travel over a connection
pub trait Message: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Connection error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection is already connecting or connected")]
    AlreadyConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Frame exceeds the {max} byte limit")]
    FrameTooLarge { max: usize },
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Connection is not ready")]
    NotReady,
    #[error("Gave up reconnecting after {failures} consecutive failures")]
    RetriesExhausted { failures: u32 },
}

/// Why a connection stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller asked for it with `disconnect()` or `close()`
    ExplicitClose,
    /// The peer closed the stream
    PeerClosed,
}

/// Notifications from a connection, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent<M> {
    Connected,
    Disconnected(DisconnectReason),
    Received(M),
    Error(ConnectionError),
}

/// Receiving side of a connection's notifications
pub struct Events<M> {
    rx: mpsc::UnboundedReceiver<ConnectionEvent<M>>,
}

impl<M> Events<M> {
    /// Wait for the next event; `None` once the connection's driver has exited
    pub async fn recv(&mut self) -> Option<ConnectionEvent<M>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConnectionEvent<M>> {
        self.rx.try_recv().ok()
    }
}

impl<M> Stream for Events<M> {
    type Item = ConnectionEvent<M>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Handle to a persistent connection to `(host, port)`
///
/// Clones share the same connection. When the last handle is dropped the
/// transport is closed without draining and no further events are sent.
pub struct Connection<M> {
    id: Uuid,
    host: Arc<str>,
    port: u16,
    timeout: Duration,
    commands: mpsc::UnboundedSender<Command<M>>,
    state: watch::Receiver<ConnectionState>,
    pending_writes: watch::Receiver<Arc<AtomicUsize>>,
}

impl<M> Clone for Connection<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            host: Arc::clone(&self.host),
            port: self.port,
            timeout: self.timeout,
            commands: self.commands.clone(),
            state: self.state.clone(),
            pending_writes: self.pending_writes.clone(),
        }
    }
}

impl<M: Message> Connection<M> {
    /// Create a TCP connection in the `Idle` state
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(host: impl Into<String>, port: u16, config: ConnectionConfig) -> (Self, Events<M>) {
        let connector = TcpConnector::new(config.keepalive, config.nodelay);
        Self::with_connector(host, port, config, Arc::new(connector))
    }

    /// Create a connection that opens its streams through `connector`
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_connector(
        host: impl Into<String>,
        port: u16,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, Events<M>) {
        let host: Arc<str> = Arc::from(host.into());
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (pending_tx, pending_rx) = watch::channel(Arc::new(AtomicUsize::new(0)));

        let connection = Self {
            id,
            host: Arc::clone(&host),
            port,
            timeout: config.timeout(),
            commands: command_tx,
            state: state_rx,
            pending_writes: pending_rx,
        };

        let driver = Driver::new(
            id,
            host,
            port,
            config,
            connector,
            command_rx,
            event_tx,
            state_tx,
            pending_tx,
        );
        tokio::spawn(driver.run());

        log::debug!("Connection {} created for {}:{}", id, connection.host, port);

        (connection, Events { rx: event_rx })
    }

    /// Start connecting; completion is reported as [`ConnectionEvent::Connected`]
    pub fn connect(&self) {
        self.submit(Command::Connect);
    }

    /// Tear the transport down at once, dropping unsent writes and any partial frame
    pub fn disconnect(&self) {
        self.submit(Command::Disconnect);
    }

    /// Stop sending, let queued writes flush, then tear the transport down
    pub fn close(&self) {
        self.submit(Command::Close);
    }

    /// Queue `message` as one frame; failures are reported as [`ConnectionEvent::Error`]
    pub fn send(&self, message: M) {
        self.submit(Command::Send(message));
    }

    fn submit(&self, command: Command<M>) {
        if self.commands.send(command).is_err() {
            log::warn!("Connection {} driver has stopped", self.id);
        }
    }
}

impl<M> Connection<M> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bound on connect attempts, writes, and the flush on close
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Writes submitted to the current transport and not yet completed
    pub fn pending_writes(&self) -> usize {
        self.pending_writes.borrow().load(Ordering::SeqCst)
    }
}
