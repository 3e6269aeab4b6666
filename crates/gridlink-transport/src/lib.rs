//! Socket, TLS and framing layer for gridlink clients
//!
//! # Architecture
//!
//! ```text
//!   SocketConnector ──► TlsUpgrader ──► PipelineBuilder::activate
//!     (TCP dial)        (optional)             │
//!                                              ▼
//!                     ┌──────────────── Connection ────────────────┐
//!                     │  producer: stream ──► bounded channel      │
//!                     │  consumer: channel ──► prefix / messages   │
//!                     │  send():   bytes ──► stream                │
//!                     │  shutdown: first loop to end, exactly once │
//!                     └────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod error;
pub mod pipeline;
pub mod socket;
pub mod tls;

pub use codec::{ChannelFrameHandler, CodecError, LengthPrefixedFrames};
pub use error::{TransportError, TransportResult};
pub use pipeline::{
    Connection, ConnectionState, ConnectionStats, Handlers, MessageBytesOutcome, MessageHandler,
    PipelineBuilder, PrefixHandler, ShutdownEvent, ShutdownHandler,
};
pub use socket::SocketConnector;
pub use tls::TlsUpgrader;

use tokio::io::{AsyncRead, AsyncWrite};

/// Duplex byte stream the pipeline runs over (plain TCP or TLS)
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed duplex stream
pub type BoxedStream = Box<dyn AsyncStream>;
