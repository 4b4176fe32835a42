//! Persistent line-delimited JSON connections
//!
//! A [`Connection`] keeps one logical connection to a `(host, port)` endpoint
//! alive, exchanging newline-terminated JSON frames and re-establishing the
//! underlying transport according to a [`ReconnectPolicy`].

pub mod backoff;
pub mod config;
pub mod connection;
pub mod server;
pub mod transport;

pub use backoff::{Backoff, ReconnectPolicy};
pub use config::ConnectionConfig;
pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionState, DisconnectReason, Events,
    Message,
};
pub use transport::{Connector, MemoryConnector, MemoryListener, TcpConnector, TransportError};
