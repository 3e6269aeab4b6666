//! Duplex framing pipeline
//!
//! A [`Connection`] runs two tasks over one stream:
//!
//! - the producer reads from the stream into a bounded channel of chunks,
//! - the consumer accumulates chunks in a [`ReadBuffer`], delivers the
//!   optional fixed-length prefix once, then hands the unconsumed bytes to
//!   the message handler until it reports nothing more is complete.
//!
//! Whichever task ends first starts the shutdown routine; an atomic flag
//! makes sure it runs once no matter how many times it is triggered
//! (read end, write failure, handler failure, [`Connection::close`]). The
//! routine cancels the shared token, waits for both tasks, closes the
//! stream and then calls the shutdown handler.

mod handler;
mod read_buffer;

pub use handler::{
    Handlers, MessageBytesOutcome, MessageHandler, PrefixHandler, ShutdownEvent, ShutdownHandler,
};

use crate::error::{TransportError, TransportResult};
use crate::{AsyncStream, BoxedStream};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use read_buffer::ReadBuffer;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

/// Bytes requested from the stream per read
const READ_CHUNK_SIZE: usize = 64 * 1024;
/// Chunks buffered between producer and consumer
const CHUNK_CHANNEL_CAPACITY: usize = 16;
/// Upper bound on closing the write side during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

tokio::task_local! {
    /// Connection whose handler is running on this task
    static HANDLER_CONNECTION: usize;
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Active,
    ShuttingDown,
    Closed,
}

/// Connection statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_secs: u64,
}

/// Configures a pipeline before it is attached to a stream
#[derive(Debug)]
pub struct PipelineBuilder {
    id: u64,
    prefix_length: usize,
    handlers: Handlers,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl PipelineBuilder {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            prefix_length: 0,
            handlers: Handlers::default(),
            local_addr: None,
            remote_addr: None,
        }
    }

    /// Length of the one-time prefix expected before any message bytes
    pub fn prefix_length(mut self, length: usize) -> Self {
        self.prefix_length = length;
        self
    }

    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn endpoints(mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    /// Attach the stream and start both tasks
    ///
    /// Fails without a message handler, or with a prefix length but no
    /// prefix handler.
    pub fn activate<S>(self, stream: S) -> TransportResult<Connection>
    where
        S: AsyncStream + 'static,
    {
        let message = self.handlers.message.clone().ok_or_else(|| {
            TransportError::InvalidState("message handler must be set before activation".into())
        })?;
        if self.prefix_length > 0 && self.handlers.prefix.is_none() {
            return Err(TransportError::InvalidState(format!(
                "prefix length {} configured without a prefix handler",
                self.prefix_length
            )));
        }

        let stream: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);
        let (state, _) = watch::channel(ConnectionState::Created);
        let (done_tx, done_rx) = mpsc::channel::<()>(1);
        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            id: self.id,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            created_at: Utc::now(),
            started: Instant::now(),
            last_read_ms: AtomicI64::new(0),
            last_write_ms: AtomicI64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            shutdown_triggered: AtomicBool::new(false),
            state,
            writer: tokio::sync::Mutex::new(Some(writer)),
            loops_done: std::sync::Mutex::new(Some(done_rx)),
            failure: std::sync::Mutex::new(None),
            shutdown_handler: self.handlers.shutdown.clone(),
        });

        inner.state.send_replace(ConnectionState::Active);
        info!(
            "[conn-{}] Active ({:?} -> {:?})",
            inner.id, inner.local_addr, inner.remote_addr
        );

        let consumer = Consumer {
            inner: inner.clone(),
            message,
            prefix: self.handlers.prefix.clone(),
            pending_prefix: self.prefix_length,
            buffer: ReadBuffer::new(),
        };

        // Each task holds a `done` sender; the shutdown routine waits for
        // the channel to close
        tokio::spawn(produce(reader, chunk_tx, inner.clone(), done_tx.clone()));
        tokio::spawn(consumer.run(chunk_rx, done_tx));

        let handle = Arc::new(inner.cancel.clone().drop_guard());
        Ok(Connection {
            inner,
            _handle: handle,
        })
    }
}

struct Inner {
    id: u64,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    created_at: DateTime<Utc>,
    started: Instant,
    last_read_ms: AtomicI64,
    last_write_ms: AtomicI64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    cancel: CancellationToken,
    shutdown_triggered: AtomicBool,
    state: watch::Sender<ConnectionState>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    loops_done: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    failure: std::sync::Mutex<Option<anyhow::Error>>,
    shutdown_handler: Option<Arc<dyn ShutdownHandler>>,
}

impl Inner {
    /// Identifies this connection in [`HANDLER_CONNECTION`]
    fn handler_key(&self) -> usize {
        self as *const Inner as usize
    }

    fn record_read(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.last_read_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_write(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.last_write_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_failure(&self, error: anyhow::Error) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(error);
        }
    }

    /// Start the shutdown routine unless it already started
    fn begin_shutdown(self: &Arc<Self>, reason: &str) {
        if self
            .shutdown_triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("[conn-{}] Shutdown already triggered ({})", self.id, reason);
            return;
        }

        debug!("[conn-{}] Shutting down: {}", self.id, reason);
        self.state.send_replace(ConnectionState::ShuttingDown);
        self.cancel.cancel();

        let inner = self.clone();
        tokio::spawn(async move { inner.finish_shutdown().await });
    }

    async fn finish_shutdown(self: Arc<Self>) {
        let done = self.loops_done.lock().ok().and_then(|mut rx| rx.take());
        if let Some(mut done) = done {
            while done.recv().await.is_some() {}
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[conn-{}] Error closing stream: {}", self.id, e),
                Err(_) => debug!("[conn-{}] Timed out closing stream", self.id),
            }
        }

        let error = self
            .failure
            .lock()
            .ok()
            .and_then(|mut failure| failure.take())
            .map(Arc::new);

        match &self.shutdown_handler {
            Some(handler) => {
                let event = ShutdownEvent {
                    connection_id: self.id,
                    error,
                };
                let callback = AssertUnwindSafe(handler.on_shutdown(event)).catch_unwind();
                if HANDLER_CONNECTION
                    .scope(self.handler_key(), callback)
                    .await
                    .is_err()
                {
                    warn!("[conn-{}] Shutdown handler panicked", self.id);
                }
            }
            None => {
                if let Some(error) = error {
                    warn!("[conn-{}] Closed after handler failure: {:#}", self.id, error);
                }
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        info!("[conn-{}] Closed", self.id);
    }
}

/// Network → channel
async fn produce(
    mut reader: ReadHalf<BoxedStream>,
    chunks: mpsc::Sender<Bytes>,
    inner: Arc<Inner>,
    _done: mpsc::Sender<()>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    let reason = loop {
        buf.reserve(READ_CHUNK_SIZE);
        let read = tokio::select! {
            result = reader.read_buf(&mut buf) => result,
            _ = inner.cancel.cancelled() => break "cancelled",
        };

        match read {
            Ok(0) => break "end of stream",
            Ok(n) => {
                inner.record_read(n);
                trace!("[conn-{}] Read {} bytes", inner.id, n);

                let chunk = buf.split().freeze();
                tokio::select! {
                    result = chunks.send(chunk) => {
                        if result.is_err() {
                            break "consumer stopped";
                        }
                    }
                    _ = inner.cancel.cancelled() => break "cancelled",
                }
            }
            Err(e) => {
                debug!("[conn-{}] Read failed: {}", inner.id, e);
                break "read error";
            }
        }
    };

    // Closing the channel is the end-of-stream signal for the consumer
    drop(chunks);
    inner.begin_shutdown(reason);
}

/// Channel → handlers
struct Consumer {
    inner: Arc<Inner>,
    message: Arc<dyn MessageHandler>,
    prefix: Option<Arc<dyn PrefixHandler>>,
    pending_prefix: usize,
    buffer: ReadBuffer,
}

impl Consumer {
    async fn run(mut self, mut chunks: mpsc::Receiver<Bytes>, _done: mpsc::Sender<()>) {
        let reason = loop {
            let chunk = tokio::select! {
                biased;
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break "end of stream",
                },
                _ = self.inner.cancel.cancelled() => break "cancelled",
            };

            self.buffer.extend(&chunk);
            while let Ok(more) = chunks.try_recv() {
                self.buffer.extend(&more);
            }

            if !self.buffer.has_unexamined() {
                continue;
            }

            if let Err(e) = self.drain().await {
                warn!("[conn-{}] Handler failed: {:#}", self.inner.id, e);
                self.inner.record_failure(e);
                break "handler failure";
            }
        };

        self.inner.begin_shutdown(reason);
    }

    /// Deliver everything currently deliverable
    async fn drain(&mut self) -> anyhow::Result<()> {
        loop {
            if self.pending_prefix > 0 {
                let length = self.pending_prefix;
                if self.buffer.len() < length {
                    self.buffer.mark_examined();
                    return Ok(());
                }

                if let Some(handler) = &self.prefix {
                    let prefix = &self.buffer.unconsumed()[..length];
                    let key = self.inner.handler_key();
                    guarded(key, "prefix", handler.on_prefix_bytes(prefix)).await?;
                }
                self.buffer.advance(length);
                self.pending_prefix = 0;
                trace!("[conn-{}] Prefix of {} bytes delivered", self.inner.id, length);
            }

            if self.buffer.is_empty() {
                return Ok(());
            }

            let available = self.buffer.len();
            let outcome = guarded(
                self.inner.handler_key(),
                "message",
                self.message.on_message_bytes(self.buffer.unconsumed()),
            )
            .await?;

            let consumed = outcome.consumed.min(available);
            self.buffer.advance(consumed);
            trace!(
                "[conn-{}] Handler consumed {} of {} bytes",
                self.inner.id,
                consumed,
                available
            );

            if !(outcome.has_more && consumed > 0 && !self.buffer.is_empty()) {
                return Ok(());
            }
        }
    }
}

/// Run a handler future, turning a panic into an error
async fn guarded<T, F>(connection: usize, what: &str, future: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let result = HANDLER_CONNECTION
        .scope(connection, AssertUnwindSafe(future).catch_unwind())
        .await;
    match result {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "{} handler panicked: {}",
            what,
            panic_message(&*panic)
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// An active framed connection
///
/// Cloning shares the same connection. Concurrent [`Connection::send`]
/// calls are written one after another, never interleaved. Dropping the
/// last handle shuts the connection down as if [`Connection::close`] had
/// been called.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    // Cancels the pipeline once the last handle is gone; the tasks only
    // hold `Inner`
    _handle: Arc<DropGuard>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn last_read(&self) -> Option<DateTime<Utc>> {
        from_millis(self.inner.last_read_ms.load(Ordering::Relaxed))
    }

    pub fn last_write(&self) -> Option<DateTime<Utc>> {
        from_millis(self.inner.last_write_ms.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            uptime_secs: self.inner.started.elapsed().as_secs(),
        }
    }

    /// Write `bytes` to the stream
    ///
    /// Returns `false` when the connection is no longer active or the write
    /// fails; a failed write shuts the connection down.
    pub async fn send(&self, bytes: &[u8]) -> bool {
        if !self.is_active() {
            return false;
        }

        let mut writer = self.inner.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return false;
        };

        let result = tokio::select! {
            result = stream.write_all(bytes) => result,
            _ = self.inner.cancel.cancelled() => return false,
        };

        match result {
            Ok(()) => {
                self.inner.record_write(bytes.len());
                trace!("[conn-{}] Sent {} bytes", self.inner.id, bytes.len());
                true
            }
            Err(e) => {
                drop(writer);
                warn!("[conn-{}] Send failed: {}", self.inner.id, e);
                self.inner.begin_shutdown("write error");
                false
            }
        }
    }

    /// Flush buffered writes; same failure handling as [`Connection::send`]
    pub async fn flush(&self) -> bool {
        if !self.is_active() {
            return false;
        }

        let mut writer = self.inner.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return false;
        };

        let result = tokio::select! {
            result = stream.flush() => result,
            _ = self.inner.cancel.cancelled() => return false,
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                drop(writer);
                warn!("[conn-{}] Flush failed: {}", self.inner.id, e);
                self.inner.begin_shutdown("flush error");
                false
            }
        }
    }

    /// Start shutting the connection down without waiting for it
    pub fn shutdown(&self) {
        self.inner.begin_shutdown("closed by caller");
    }

    /// Shut the connection down and wait until it is closed
    ///
    /// Safe to call any number of times. From inside one of this
    /// connection's own handlers it only starts the shutdown, since the
    /// shutdown routine waits for that handler to return.
    pub async fn close(&self) {
        self.shutdown();
        if self.in_own_handler() {
            debug!("[conn-{}] Close requested from a handler", self.inner.id);
            return;
        }
        self.closed().await;
    }

    fn in_own_handler(&self) -> bool {
        HANDLER_CONNECTION
            .try_with(|key| *key == self.inner.handler_key())
            .unwrap_or(false)
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        None
    } else {
        DateTime::<Utc>::from_timestamp_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Ignore;

    #[async_trait]
    impl MessageHandler for Ignore {
        async fn on_message_bytes(&self, bytes: &[u8]) -> anyhow::Result<MessageBytesOutcome> {
            Ok(MessageBytesOutcome::consumed(bytes.len(), false))
        }
    }

    #[tokio::test]
    async fn test_activate_requires_message_handler() {
        let (client, _server) = tokio::io::duplex(64);
        let err = PipelineBuilder::new(1).activate(client).unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_activate_requires_prefix_handler() {
        let (client, _server) = tokio::io::duplex(64);
        let err = PipelineBuilder::new(1)
            .prefix_length(3)
            .handlers(Handlers::new(Arc::new(Ignore)))
            .activate(client)
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_metadata() {
        let (client, _server) = tokio::io::duplex(64);
        let remote: SocketAddr = "10.0.0.1:5701".parse().unwrap();
        let connection = PipelineBuilder::new(42)
            .handlers(Handlers::new(Arc::new(Ignore)))
            .endpoints(None, Some(remote))
            .activate(client)
            .unwrap();

        assert_eq!(connection.id(), 42);
        assert_eq!(connection.remote_addr(), Some(remote));
        assert_eq!(connection.state(), ConnectionState::Active);
        assert!(connection.last_read().is_none());
        assert!(connection.last_write().is_none());
        assert!(connection.created_at() <= Utc::now());

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
