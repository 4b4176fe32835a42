//! TCP transport implementation using tokio

use super::{Connector, TransportError, TransportStream};
use async_trait::async_trait;
use socket2::SockRef;
use tokio::net::TcpStream;

/// Opens TCP streams to `(host, port)`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    keepalive: bool,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(keepalive: bool, nodelay: bool) -> Self {
        Self { keepalive, nodelay }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, host: &str, port: u16) -> Result<TransportStream, TransportError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    TransportError::Connection(format!("Connection refused by {}:{}", host, port))
                }
                std::io::ErrorKind::TimedOut => {
                    TransportError::Connection(format!("Timed out connecting to {}:{}", host, port))
                }
                _ => TransportError::Connection(format!(
                    "Failed to connect to {}:{}: {}",
                    host, port, e
                )),
            })?;

        stream.set_nodelay(self.nodelay)?;
        if self.keepalive {
            SockRef::from(&stream).set_keepalive(true)?;
        }

        if let Ok(addr) = stream.peer_addr() {
            log::debug!("TCP stream open to {}", addr);
        }

        let (reader, writer) = stream.into_split();
        Ok(TransportStream::new(reader, writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_and_exchange_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap()
        });

        let mut stream = TcpConnector::default()
            .open("127.0.0.1", port)
            .await
            .unwrap();
        stream.writer.write_all(b"{\"id\":1}\n").await.unwrap();
        stream.writer.flush().await.unwrap();

        let line = accept.await.unwrap();
        assert_eq!(line.as_deref(), Some("{\"id\":1}"));
    }

    #[tokio::test]
    async fn test_open_refused() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = TcpConnector::default().open("127.0.0.1", port).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
