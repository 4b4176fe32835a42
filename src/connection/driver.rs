//! Connection driver
//!
//! One task per connection owns the transport and applies every state
//! transition, so caller commands, incoming frames, write completions and
//! retry timers are handled strictly one at a time.

use super::{ConnectionError, ConnectionEvent, ConnectionState, DisconnectReason, Message};
use crate::config::ConnectionConfig;
use crate::transport::codec::{self, CodecError, JsonLineCodec};
use crate::transport::{BoxedReader, BoxedWriter, Connector, TransportStream};
use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, Sleep};
use tokio_util::codec::FramedRead;
use uuid::Uuid;

pub(super) enum Command<M> {
    Connect,
    Disconnect,
    Close,
    Send(M),
}

enum ReadOutcome<M> {
    Frame(M),
    Failed(CodecError),
    Eof,
    IdleTimeout,
}

type Frames<M> = FramedRead<BoxedReader, JsonLineCodec<M>>;

/// A freshly opened stream and the permit that marks it as the live transport
type Opened = (TransportStream, OwnedSemaphorePermit);

pub(super) struct Driver<M> {
    id: Uuid,
    host: Arc<str>,
    port: u16,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command<M>>,
    events: mpsc::UnboundedSender<ConnectionEvent<M>>,
    state: watch::Sender<ConnectionState>,
    /// Counter of the current session; replaced whenever a session ends
    pending_writes: watch::Sender<Arc<AtomicUsize>>,
    /// One permit, held by the write half of the live transport
    transport_slot: Arc<Semaphore>,
    /// Consecutive failures since the last time the connection was ready
    failures: u32,
    connect_after_close: bool,

    connecting: Option<BoxFuture<'static, Result<Opened, ConnectionError>>>,
    retry: Option<Pin<Box<Sleep>>>,
    frames: Option<Frames<M>>,
    idle: Option<Pin<Box<Sleep>>>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    writer: Option<JoinHandle<()>>,
    write_failures: Option<mpsc::UnboundedReceiver<ConnectionError>>,
    draining: Option<BoxFuture<'static, ()>>,
    drain_abort: Option<AbortHandle>,
}

impl<M: Message> Driver<M> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: Uuid,
        host: Arc<str>,
        port: u16,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command<M>>,
        events: mpsc::UnboundedSender<ConnectionEvent<M>>,
        state: watch::Sender<ConnectionState>,
        pending_writes: watch::Sender<Arc<AtomicUsize>>,
    ) -> Self {
        Self {
            id,
            host,
            port,
            config,
            connector,
            commands,
            events,
            state,
            pending_writes,
            transport_slot: Arc::new(Semaphore::new(1)),
            failures: 0,
            connect_after_close: false,
            connecting: None,
            retry: None,
            frames: None,
            idle: None,
            outbound: None,
            writer: None,
            write_failures: None,
            draining: None,
            drain_abort: None,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                result = poll_slot(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }

                _ = poll_slot(&mut self.retry), if self.retry.is_some() => {
                    self.retry = None;
                    self.start_attempt();
                }

                outcome = next_frame(&mut self.frames), if self.frames.is_some() => {
                    self.on_read(outcome);
                }

                _ = poll_slot(&mut self.idle), if self.idle.is_some() => {
                    self.idle = None;
                    self.on_read(ReadOutcome::IdleTimeout);
                }

                failure = next_write_failure(&mut self.write_failures), if self.write_failures.is_some() => {
                    match failure {
                        Some(error) => self.on_write_failure(error),
                        None => self.write_failures = None,
                    }
                }

                _ = poll_slot(&mut self.draining), if self.draining.is_some() => {
                    self.draining = None;
                    self.drain_abort = None;
                    self.finish_close();
                }
            }
        }

        log::debug!("Connection {} released, closing transport", self.id);
        self.teardown();
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.current();
        debug_assert!(
            previous.can_transition_to(next),
            "illegal transition {} -> {}",
            previous,
            next
        );
        log::debug!("Connection {}: {} -> {}", self.id, previous, next);
        self.state.send_replace(next);
    }

    fn emit(&self, event: ConnectionEvent<M>) {
        // Nobody listening is not an error
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command<M>) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Close => self.close(),
            Command::Send(message) => self.send(message),
        }
    }

    fn connect(&mut self) {
        match self.current() {
            ConnectionState::Connecting | ConnectionState::Ready => {
                log::debug!("Connection {}: connect ignored, already {}", self.id, self.current());
                self.emit(ConnectionEvent::Error(ConnectionError::AlreadyConnected));
            }
            ConnectionState::Disconnecting => {
                self.connect_after_close = true;
            }
            ConnectionState::Failed => {
                self.retry = None;
                self.start_attempt();
            }
            ConnectionState::Idle | ConnectionState::Cancelled => {
                self.failures = 0;
                self.start_attempt();
            }
        }
    }

    fn disconnect(&mut self) {
        match self.current() {
            ConnectionState::Cancelled => {}
            ConnectionState::Ready => {
                self.set_state(ConnectionState::Disconnecting);
                self.cancel();
            }
            _ => self.cancel(),
        }
    }

    /// Drop everything immediately and settle in `Cancelled`
    fn cancel(&mut self) {
        self.teardown();
        self.connect_after_close = false;
        self.set_state(ConnectionState::Cancelled);
        self.emit(ConnectionEvent::Disconnected(DisconnectReason::ExplicitClose));
    }

    fn close(&mut self) {
        match self.current() {
            ConnectionState::Cancelled | ConnectionState::Disconnecting => {}
            ConnectionState::Ready => {
                self.set_state(ConnectionState::Disconnecting);
                self.frames = None;
                self.idle = None;
                self.write_failures = None;
                // Closing the queue lets the writer flush what it already has, then shut down
                self.outbound = None;

                if let Some(writer) = self.writer.take() {
                    let abort = writer.abort_handle();
                    let timeout = self.config.timeout();
                    let id = self.id;
                    self.drain_abort = Some(abort.clone());
                    self.draining = Some(Box::pin(async move {
                        if tokio::time::timeout(timeout, writer).await.is_err() {
                            log::warn!("Connection {}: pending writes not flushed within {:?}", id, timeout);
                            abort.abort();
                        }
                    }));
                } else {
                    self.finish_close();
                }
            }
            _ => self.cancel(),
        }
    }

    fn finish_close(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Cancelled);
        self.emit(ConnectionEvent::Disconnected(DisconnectReason::ExplicitClose));

        if std::mem::take(&mut self.connect_after_close) {
            self.failures = 0;
            self.start_attempt();
        }
    }

    fn send(&mut self, message: M) {
        let outbound = match (&self.outbound, self.current()) {
            (Some(outbound), ConnectionState::Ready) => outbound,
            _ => {
                log::debug!("Connection {}: send dropped while {}", self.id, self.current());
                self.emit(ConnectionEvent::Error(ConnectionError::NotReady));
                return;
            }
        };

        let frame = match codec::encode_frame(&message, self.config.max_frame_len) {
            Ok(frame) => frame,
            Err(e) => {
                self.emit(ConnectionEvent::Error(e.into()));
                return;
            }
        };

        let pending = Arc::clone(&self.pending_writes.borrow());
        pending.fetch_add(1, Ordering::SeqCst);
        if outbound.send(frame).is_err() {
            pending.fetch_sub(1, Ordering::SeqCst);
            self.emit(ConnectionEvent::Error(ConnectionError::SendFailed(
                "writer has stopped".to_string(),
            )));
        }
    }

    /// Close the current transport, if any, and open a fresh one
    fn start_attempt(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let host = Arc::clone(&self.host);
        let port = self.port;
        let timeout = self.config.timeout();
        let slot = Arc::clone(&self.transport_slot);

        log::info!("Connection {}: connecting to {}:{}", self.id, host, port);

        self.connecting = Some(Box::pin(async move {
            // Released once the previous writer task has dropped its write half
            let permit = match slot.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(ConnectionError::ConnectionFailed(
                        "Transport slot closed".to_string(),
                    ));
                }
            };

            match tokio::time::timeout(timeout, connector.open(&host, port)).await {
                Ok(Ok(stream)) => Ok((stream, permit)),
                Ok(Err(e)) => Err(ConnectionError::ConnectionFailed(e.to_string())),
                Err(_) => Err(ConnectionError::ConnectionFailed(format!(
                    "Timed out after {:?} connecting to {}:{}",
                    timeout, host, port
                ))),
            }
        }));
    }

    fn on_connect_result(&mut self, result: Result<Opened, ConnectionError>) {
        match result {
            Ok((stream, permit)) => {
                let TransportStream { reader, writer } = stream;
                let pending = Arc::new(AtomicUsize::new(0));
                let (frame_tx, frame_rx) = mpsc::unbounded_channel();
                let (failure_tx, failure_rx) = mpsc::unbounded_channel();

                self.frames = Some(FramedRead::new(
                    reader,
                    JsonLineCodec::new(self.config.max_frame_len),
                ));
                self.idle = self
                    .config
                    .read_idle_timeout()
                    .map(|timeout| Box::pin(tokio::time::sleep(timeout)));
                self.outbound = Some(frame_tx);
                self.write_failures = Some(failure_rx);
                self.pending_writes.send_replace(Arc::clone(&pending));
                self.writer = Some(tokio::spawn(write_loop(
                    self.id,
                    LiveWriter {
                        inner: writer,
                        _slot: permit,
                    },
                    frame_rx,
                    failure_tx,
                    self.config.timeout(),
                    pending,
                )));
                self.failures = 0;

                log::info!("Connection {}: ready", self.id);
                self.set_state(ConnectionState::Ready);
                self.emit(ConnectionEvent::Connected);
            }
            Err(error) => {
                log::warn!("Connection {}: {}", self.id, error);
                self.emit(ConnectionEvent::Error(error));
                self.fail();
            }
        }
    }

    fn on_read(&mut self, outcome: ReadOutcome<M>) {
        match outcome {
            ReadOutcome::Frame(message) => {
                if let (Some(idle), Some(timeout)) =
                    (self.idle.as_mut(), self.config.read_idle_timeout())
                {
                    idle.as_mut().reset(Instant::now() + timeout);
                }
                self.emit(ConnectionEvent::Received(message));
            }
            ReadOutcome::Eof => {
                log::info!("Connection {}: closed by peer", self.id);
                self.emit(ConnectionEvent::Disconnected(DisconnectReason::PeerClosed));
                self.fail();
            }
            ReadOutcome::IdleTimeout => {
                let error = ConnectionError::ConnectionFailed("Read idle timeout".to_string());
                log::warn!("Connection {}: {}", self.id, error);
                self.emit(ConnectionEvent::Error(error));
                self.fail();
            }
            ReadOutcome::Failed(CodecError::Io(e)) => {
                log::warn!("Connection {}: read failed: {}", self.id, e);
                self.emit(ConnectionEvent::Error(ConnectionError::ConnectionFailed(
                    e.to_string(),
                )));
                self.fail();
            }
            ReadOutcome::Failed(e) => {
                // Reading stays halted; the caller decides whether to disconnect
                log::warn!("Connection {}: stopped reading: {}", self.id, e);
                self.frames = None;
                self.idle = None;
                self.emit(ConnectionEvent::Error(e.into()));
            }
        }
    }

    fn on_write_failure(&mut self, error: ConnectionError) {
        if self.current() != ConnectionState::Ready {
            return;
        }
        log::warn!("Connection {}: {}", self.id, error);
        self.emit(ConnectionEvent::Error(error));
        self.emit(ConnectionEvent::Error(ConnectionError::ConnectionFailed(
            "Transport write failed".to_string(),
        )));
        self.fail();
    }

    /// Discard the transport and retry according to the reconnect policy
    fn fail(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Failed);
        self.failures = self.failures.saturating_add(1);

        match self.config.reconnect.next_delay(self.failures) {
            Some(delay) if delay.is_zero() => self.start_attempt(),
            Some(delay) => {
                log::info!(
                    "Connection {}: retrying in {:?} (failure {})",
                    self.id,
                    delay,
                    self.failures
                );
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            None => {
                log::warn!(
                    "Connection {}: giving up after {} failures",
                    self.id,
                    self.failures
                );
                self.set_state(ConnectionState::Cancelled);
                self.emit(ConnectionEvent::Error(ConnectionError::RetriesExhausted {
                    failures: self.failures,
                }));
            }
        }
    }

    /// Release every transport resource without waiting for in-flight work
    ///
    /// An aborted writer task still owns its write half until the runtime
    /// drops it; the next attempt waits for that through `transport_slot`.
    fn teardown(&mut self) {
        self.connecting = None;
        self.retry = None;
        self.frames = None;
        self.idle = None;
        self.outbound = None;
        self.write_failures = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(abort) = self.drain_abort.take() {
            abort.abort();
        }
        self.draining = None;
        self.pending_writes.send_replace(Arc::new(AtomicUsize::new(0)));
    }
}

impl From<CodecError> for ConnectionError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::FrameTooLarge { max } => ConnectionError::FrameTooLarge { max },
            CodecError::Io(e) => ConnectionError::ConnectionFailed(e.to_string()),
            other => ConnectionError::ReceiveFailed(other.to_string()),
        }
    }
}

/// Write half of the live transport
///
/// Fields drop in order, so the slot frees up only after the stream is closed.
struct LiveWriter {
    inner: BoxedWriter,
    _slot: OwnedSemaphorePermit,
}

/// Await whatever future occupies `slot`; never resolves when it is empty
async fn poll_slot<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame<M: Message>(frames: &mut Option<Frames<M>>) -> ReadOutcome<M> {
    let Some(frames) = frames else {
        return std::future::pending().await;
    };

    match frames.next().await {
        Some(Ok(message)) => ReadOutcome::Frame(message),
        Some(Err(e)) => ReadOutcome::Failed(e),
        None => ReadOutcome::Eof,
    }
}

async fn next_write_failure(
    failures: &mut Option<mpsc::UnboundedReceiver<ConnectionError>>,
) -> Option<ConnectionError> {
    match failures {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Write queued frames in submission order, each bounded by `timeout`
///
/// Stops at the first failure. When the queue is closed and empty the write
/// side is shut down.
async fn write_loop(
    id: Uuid,
    mut writer: LiveWriter,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    failures: mpsc::UnboundedSender<ConnectionError>,
    timeout: Duration,
    pending_writes: Arc<AtomicUsize>,
) {
    while let Some(frame) = frames.recv().await {
        let result = tokio::time::timeout(timeout, async {
            writer.inner.write_all(&frame).await?;
            writer.inner.flush().await
        })
        .await;
        pending_writes.fetch_sub(1, Ordering::SeqCst);

        let error = match result {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => ConnectionError::SendFailed(e.to_string()),
            Err(_) => ConnectionError::SendFailed(format!("Write timed out after {:?}", timeout)),
        };
        log::debug!("Connection {}: writer stopping: {}", id, error);
        let _ = failures.send(error);
        return;
    }

    if let Err(e) = writer.inner.shutdown().await {
        log::debug!("Connection {}: shutdown failed: {}", id, e);
    }
}
