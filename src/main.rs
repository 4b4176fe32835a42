use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use connkit::config::config_path;
use connkit::server::EchoServer;
use connkit::{
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, DisconnectReason, Events,
};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "connkit")]
#[command(about = "Line-delimited JSON over persistent TCP connections")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo peer that writes every frame back
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        #[arg(long, default_value = "9000")]
        port: u16,

        /// Largest accepted frame in bytes
        #[arg(long, default_value = "32767")]
        max_frame_len: usize,
    },

    /// Keep a connection open: JSON lines from stdin are sent, received frames are printed
    Connect {
        #[arg(default_value = "localhost")]
        host: String,

        #[arg(default_value = "9000")]
        port: u16,

        /// Config file (defaults to ~/.config/connkit/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Send one message and print the first reply
    Send {
        /// JSON document to send
        message: String,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value = "9000")]
        port: u16,

        /// Seconds to wait for a reply
        #[arg(long, default_value = "5")]
        wait: u64,

        /// Config file (defaults to ~/.config/connkit/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the config file location and effective settings
    Config {
        /// Write the effective settings to the config file
        #[arg(long)]
        write: bool,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<ConnectionConfig> {
    match path {
        Some(path) => ConnectionConfig::load_from(&path),
        None => Ok(ConnectionConfig::load()),
    }
}

async fn serve(bind: &str, port: u16, max_frame_len: usize) -> Result<()> {
    let server = EchoServer::bind((bind, port), max_frame_len)
        .await
        .with_context(|| format!("Failed to start echo server on {}:{}", bind, port))?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

async fn connect(host: String, port: u16, config: ConnectionConfig) -> Result<()> {
    let (conn, mut events) = Connection::<Value>::new(host, port, config);
    conn.connect();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Value>(&line) {
                    Ok(message) => conn.send(message),
                    Err(e) => eprintln!("Invalid JSON: {}", e),
                },
                None => {
                    // EOF on stdin: flush what was sent, then leave
                    stdin_open = false;
                    conn.close();
                }
            },

            event = events.recv() => match event {
                Some(ConnectionEvent::Connected) => {
                    eprintln!("Connected to {}:{}", conn.host(), conn.port());
                }
                Some(ConnectionEvent::Received(message)) => println!("{}", message),
                Some(ConnectionEvent::Disconnected(DisconnectReason::ExplicitClose)) => break,
                Some(ConnectionEvent::Disconnected(DisconnectReason::PeerClosed)) => {
                    eprintln!("Peer closed the connection");
                }
                Some(ConnectionEvent::Error(e @ ConnectionError::RetriesExhausted { .. })) => {
                    bail!(e);
                }
                Some(ConnectionEvent::Error(e)) => eprintln!("Error: {}", e),
                None => break,
            },

            _ = tokio::signal::ctrl_c() => {
                conn.disconnect();
                break;
            }
        }
    }

    Ok(())
}

/// Send `message` once and wait for the first frame that comes back
async fn request(
    conn: &Connection<Value>,
    events: &mut Events<Value>,
    message: Value,
) -> Result<Value> {
    let mut message = Some(message);
    while let Some(event) = events.recv().await {
        match event {
            // Reconnects keep waiting for the reply without repeating the request
            ConnectionEvent::Connected => {
                if let Some(message) = message.take() {
                    conn.send(message);
                }
            }
            ConnectionEvent::Received(reply) => return Ok(reply),
            ConnectionEvent::Error(e @ ConnectionError::RetriesExhausted { .. }) => {
                return Err(anyhow!(e));
            }
            ConnectionEvent::Error(e) => log::warn!("{}", e),
            ConnectionEvent::Disconnected(reason) => log::debug!("Disconnected: {:?}", reason),
        }
    }
    Err(anyhow!("Connection stopped before a reply arrived"))
}

async fn send(
    host: String,
    port: u16,
    message: &str,
    wait: Duration,
    config: ConnectionConfig,
) -> Result<Value> {
    let message: Value = serde_json::from_str(message).context("Message is not valid JSON")?;
    let (conn, mut events) = Connection::<Value>::new(host, port, config);
    conn.connect();

    let reply = tokio::time::timeout(wait, request(&conn, &mut events, message))
        .await
        .map_err(|_| anyhow!("No reply within {}s", wait.as_secs()))??;

    conn.close();
    while let Some(event) = events.recv().await {
        if matches!(event, ConnectionEvent::Disconnected(_)) {
            break;
        }
    }

    Ok(reply)
}

fn show_config(write: bool) -> Result<()> {
    let path = config_path().ok_or_else(|| anyhow!("Could not determine config directory"))?;
    let config = ConnectionConfig::load();

    println!("Config file: {}", path.display());
    println!();
    println!("{}", toml::to_string_pretty(&config)?);

    if write {
        config.save_to(&path)?;
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            bind,
            port,
            max_frame_len,
        } => serve(&bind, port, max_frame_len).await,

        Commands::Connect { host, port, config } => match load_config(config) {
            Ok(config) => connect(host, port, config).await,
            Err(e) => Err(e),
        },

        Commands::Send {
            message,
            host,
            port,
            wait,
            config,
        } => match load_config(config) {
            Ok(config) => send(host, port, &message, Duration::from_secs(wait), config)
                .await
                .and_then(|reply| {
                    println!("{}", serde_json::to_string_pretty(&reply)?);
                    Ok(())
                }),
            Err(e) => Err(e),
        },

        Commands::Config { write } => show_config(write),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connkit::{MemoryConnector, ReconnectPolicy};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_request_not_repeated_after_reconnect() {
        let (connector, listener) = MemoryConnector::pair();
        let config = ConnectionConfig::default().with_reconnect(ReconnectPolicy::immediate());
        let (conn, mut events) =
            Connection::<Value>::with_connector("localhost", 9000, config, Arc::new(connector));
        conn.connect();

        let peer = tokio::spawn(async move {
            // First session takes the request and hangs up without replying
            let first = listener.accept().await.unwrap();
            let mut lines = BufReader::new(first.stream).lines();
            let received = lines.next_line().await.unwrap();
            drop(lines);

            let second = listener.accept().await.unwrap();
            let (reader, mut writer) = tokio::io::split(second.stream);
            writer.write_all(b"{\"reply\":true}\n").await.unwrap();
            let mut lines = BufReader::new(reader).lines();
            let repeated = timeout(Duration::from_millis(200), lines.next_line()).await;
            (received, repeated.is_ok())
        });

        let reply = timeout(Duration::from_secs(2), request(&conn, &mut events, json!({"id": 1})))
            .await
            .expect("timed out waiting for a reply")
            .unwrap();
        assert_eq!(reply, json!({"reply": true}));

        let (received, repeated) = peer.await.unwrap();
        assert_eq!(received.as_deref(), Some("{\"id\":1}"));
        assert!(!repeated);
    }
}
