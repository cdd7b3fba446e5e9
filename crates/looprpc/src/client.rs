//! # Client Contract
//!
//! `Invoker` is what every client-side wrapper speaks: a raw `Peer`, the
//! self-healing connection built on top of it, and tagged clients that route
//! through a shared connection all implement it, so they stack freely.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;

use crate::context::Context;
use crate::metadata::Metadata;
use crate::status::Status;

/// Server messages of a streaming call, terminated by the call's final status.
pub struct Streaming {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, Status>>,
    finished: bool,
    reader: Option<DropGuard>,
}

impl Streaming {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<Vec<u8>, Status>>) -> Self {
        Self {
            rx,
            finished: false,
            reader: None,
        }
    }

    /// Like `new`, but cancels `reader` once the stream has ended or is dropped.
    pub fn with_reader_token(
        rx: mpsc::UnboundedReceiver<Result<Vec<u8>, Status>>,
        reader: CancellationToken,
    ) -> Self {
        Self {
            rx,
            finished: false,
            reader: Some(reader.drop_guard()),
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.reader = None;
    }

    /// Next message, `Ok(None)` after a successful end of stream.
    pub async fn message(&mut self) -> Result<Option<Vec<u8>>, Status> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(status)) => {
                self.finish();
                Err(status)
            }
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    /// Drains the stream.
    pub async fn collect(mut self) -> Result<Vec<Vec<u8>>, Status> {
        let mut messages = Vec::new();
        while let Some(message) = self.message().await? {
            messages.push(message);
        }
        Ok(messages)
    }
}

/// A generic RPC client.
#[async_trait::async_trait]
pub trait Invoker: Send + Sync + 'static {
    /// Unary call.
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status>;

    /// Server-streaming call.
    async fn open_stream(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Streaming, Status>;
}

#[async_trait::async_trait]
impl<T: Invoker + ?Sized> Invoker for Arc<T> {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        (**self).invoke(ctx, method, metadata, payload).await
    }

    async fn open_stream(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Streaming, Status> {
        (**self).open_stream(ctx, method, metadata, payload).await
    }
}
