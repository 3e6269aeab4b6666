//! Handler contracts between the pipeline and the protocol layer

use async_trait::async_trait;
use std::sync::Arc;

/// What a message handler did with the bytes it was shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBytesOutcome {
    /// Bytes consumed from the front of the range
    pub consumed: usize,
    /// Another complete frame may remain in the unconsumed bytes
    pub has_more: bool,
}

impl MessageBytesOutcome {
    pub fn consumed(consumed: usize, has_more: bool) -> Self {
        Self { consumed, has_more }
    }

    /// Nothing complete yet; wait for more bytes
    pub fn incomplete() -> Self {
        Self {
            consumed: 0,
            has_more: false,
        }
    }
}

/// Consumes complete frames from the front of the available bytes
///
/// Anything not consumed is presented again, followed by newly received
/// bytes, on the next call.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message_bytes(&self, bytes: &[u8]) -> anyhow::Result<MessageBytesOutcome>;
}

/// Receives the fixed-length connection prefix, once
#[async_trait]
pub trait PrefixHandler: Send + Sync {
    async fn on_prefix_bytes(&self, prefix: &[u8]) -> anyhow::Result<()>;
}

/// Notified once when a connection has closed
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn on_shutdown(&self, event: ShutdownEvent);
}

/// Passed to the shutdown handler
#[derive(Debug, Clone)]
pub struct ShutdownEvent {
    pub connection_id: u64,
    /// Handler failure that ended the read side, if any
    pub error: Option<Arc<anyhow::Error>>,
}

/// Handler registration, fixed at activation
#[derive(Clone, Default)]
pub struct Handlers {
    pub message: Option<Arc<dyn MessageHandler>>,
    pub prefix: Option<Arc<dyn PrefixHandler>>,
    pub shutdown: Option<Arc<dyn ShutdownHandler>>,
}

impl Handlers {
    pub fn new(message: Arc<dyn MessageHandler>) -> Self {
        Self {
            message: Some(message),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, handler: Arc<dyn PrefixHandler>) -> Self {
        self.prefix = Some(handler);
        self
    }

    pub fn with_shutdown(mut self, handler: Arc<dyn ShutdownHandler>) -> Self {
        self.shutdown = Some(handler);
        self
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("message", &self.message.is_some())
            .field("prefix", &self.prefix.is_some())
            .field("shutdown", &self.shutdown.is_some())
            .finish()
    }
}
