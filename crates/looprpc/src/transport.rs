//! # Transport Abstraction
//!
//! A minimal, async interface for moving messages between two ends of one
//! logical connection.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: The Transport knows nothing about frames, methods or
//!   metadata. It moves opaque, already delimited buffers.
//! - **Duplex**: Either end may send at any time; `recv` yields the next message
//!   from the other end, or `None` once the other end is gone.

use std::sync::Arc;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The other end is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// This end was closed locally.
    #[error("transport closed")]
    Closed,
    /// Generic I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One end of a message pipe.
///
/// This trait is object-safe (`Box<dyn Transport>` / `Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message.
    ///
    /// # invariants
    /// - Returns `Ok(None)` once the other end has closed and all buffered
    ///   messages were delivered.
    /// - Returns `Ok(None)` promptly after `close` was called on this end.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes this end. The other end observes end-of-stream. Idempotent.
    async fn close(&self);
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        (**self).send(payload).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        (**self).recv().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        (**self).send(payload).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        (**self).recv().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
