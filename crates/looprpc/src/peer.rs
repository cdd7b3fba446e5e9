//! # RPC Peer with Async Pump
//!
//! This module provides the `Peer` abstraction: the client end of one logical
//! connection. It uses an async pump task to demultiplex incoming replies and
//! correlate them with pending requests via sequence numbers.
//!
//! ## Invariants
//!
//! - A call whose context is already done never reaches the wire.
//! - Once the transport ends, every pending and every future call fails with
//!   `Unavailable`. A peer never recovers; replacing it is the caller's job.
//! - A call abandoned because its context finished sends a `Cancel` frame so
//!   the server can stop working on it. For streams this also holds after the
//!   stream has opened, and when the reader drops the stream before its end.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::client::Invoker;
use crate::client::Streaming;
use crate::context::Context;
use crate::frame::Frame;
use crate::frame::Kind;
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::Transport;

/// Where the reply for a sequence number goes.
enum Pending {
    Unary(oneshot::Sender<Result<Vec<u8>, Status>>),
    Stream(mpsc::UnboundedSender<Result<Vec<u8>, Status>>),
}

/// RPC peer with async message pump for concurrent requests.
///
/// Each Peer owns its transport exclusively, ensuring sequence numbers are
/// scoped to a single transport. Peers can be wrapped in Arc for sharing
/// across tasks.
pub struct Peer {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<DashMap<u64, Pending>>,
    seq_gen: AtomicU64,
    closed: CancellationToken,
}

impl Peer {
    /// Creates a new peer and spawns the background pump task.
    /// The name is used for logging and diagnostics.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let name = name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        tokio::spawn(Self::pump(
            name.clone(),
            transport.clone(),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            name,
            transport,
            pending,
            seq_gen: AtomicU64::new(1),
            closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the underlying transport is gone or `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the transport and fails all pending calls. Idempotent.
    pub async fn close(&self) {
        self.closed.cancel();
        self.transport.close().await;
    }

    async fn pump(
        name: String,
        transport: Arc<dyn Transport>,
        pending: Arc<DashMap<u64, Pending>>,
        closed: CancellationToken,
    ) {
        let reason = loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break String::from("connection closed"),
                next = transport.recv() => next,
            };
            match next {
                Ok(Some(message)) => {
                    if let Err(status) = Self::handle_message(&message, &pending) {
                        warn!(peer = %name, error = %status, "dropping connection after bad frame");
                        break status.to_string();
                    }
                }
                Ok(None) => break String::from("connection closed by remote"),
                Err(e) => break e.to_string(),
            }
        };

        debug!(peer = %name, reason = %reason, "pump stopped");
        closed.cancel();
        Self::notify_all_pending(&pending, Status::unavailable(reason));
    }

    /// Fails every pending request with the given status.
    fn notify_all_pending(pending: &DashMap<u64, Pending>, status: Status) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = pending.remove(&key) {
                match entry {
                    Pending::Unary(tx) => {
                        let _ = tx.send(Err(status.clone()));
                    }
                    Pending::Stream(tx) => {
                        let _ = tx.send(Err(status.clone()));
                    }
                }
            }
        }
    }

    /// Routes one incoming frame to its waiting caller.
    fn handle_message(message: &[u8], pending: &DashMap<u64, Pending>) -> Result<(), Status> {
        match Frame::from_bytes(message)? {
            Kind::Reply(reply) => {
                // no entry means the caller gave up already
                let Some((_, entry)) = pending.remove(&reply.seq) else {
                    trace!(seq = reply.seq, "reply for abandoned call");
                    return Ok(());
                };
                let result = reply.into_result();
                match entry {
                    Pending::Unary(tx) => {
                        let _ = tx.send(result);
                    }
                    Pending::Stream(tx) => {
                        if let Err(status) = result {
                            let _ = tx.send(Err(status));
                        }
                    }
                }
                Ok(())
            }
            Kind::StreamItem(item) => {
                if let Some(entry) = pending.get(&item.seq) {
                    if let Pending::Stream(tx) = entry.value() {
                        let _ = tx.send(Ok(item.payload));
                    }
                }
                Ok(())
            }
            Kind::Call(_) | Kind::Cancel(_) => Err(Status::internal(
                "client received a server-bound frame",
            )),
        }
    }

    /// Registers `entry` and sends the call frame. Undoes the registration on failure.
    async fn start_call(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
        entry: Pending,
        streaming: bool,
    ) -> Result<u64, Status> {
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }

        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(seq, entry);

        // checked after registering so the pump either sees the entry or we see the close
        if self.closed.is_cancelled() {
            self.pending.remove(&seq);
            return Err(Status::unavailable(format!("{}: connection closed", self.name)));
        }

        let timeout_ms = ctx
            .remaining()
            .map(|d| (d.as_millis() as u64).max(1))
            .unwrap_or(0);
        let frame = Frame::call(seq, method, metadata, payload, streaming, timeout_ms);

        if let Err(e) = self.transport.send(&frame.to_bytes()).await {
            self.pending.remove(&seq);
            return Err(Status::unavailable(format!("{}: send failed: {}", self.name, e)));
        }

        Ok(seq)
    }

    /// Forgets a call and tells the server to stop working on it.
    async fn abandon(&self, seq: u64) {
        self.pending.remove(&seq);
        let _ = self.transport.send(&Frame::cancel(seq).to_bytes()).await;
    }

    /// Abandons an open stream once its context finishes or its reader goes away.
    async fn watch_stream(
        seq: u64,
        ctx: Context,
        reader: CancellationToken,
        pending: Arc<DashMap<u64, Pending>>,
        transport: Arc<dyn Transport>,
        closed: CancellationToken,
    ) {
        let reason = tokio::select! {
            _ = closed.cancelled() => return,
            _ = reader.cancelled() => None,
            e = ctx.done() => Some(e),
        };
        // no entry means the final reply already arrived
        let Some((_, entry)) = pending.remove(&seq) else {
            return;
        };
        if let (Pending::Stream(tx), Some(e)) = (entry, reason) {
            let _ = tx.send(Err(e.into()));
        }
        trace!(seq, "abandoning stream");
        let _ = transport.send(&Frame::cancel(seq).to_bytes()).await;
    }
}

#[async_trait::async_trait]
impl Invoker for Peer {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        let (tx, rx) = oneshot::channel();
        let seq = self
            .start_call(ctx, method, metadata, payload, Pending::Unary(tx), false)
            .await?;

        tokio::select! {
            reply = rx => reply.unwrap_or_else(|_| {
                Err(Status::unavailable(format!("{}: connection closed", self.name)))
            }),
            e = ctx.done() => {
                self.abandon(seq).await;
                Err(e.into())
            }
        }
    }

    async fn open_stream(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Streaming, Status> {
        let (tx, rx) = mpsc::unbounded_channel();
        let seq = self
            .start_call(ctx, method, metadata, payload, Pending::Stream(tx), true)
            .await?;

        let reader = CancellationToken::new();
        tokio::spawn(Self::watch_stream(
            seq,
            ctx.clone(),
            reader.clone(),
            self.pending.clone(),
            self.transport.clone(),
            self.closed.clone(),
        ));
        Ok(Streaming::with_reader_token(rx, reader))
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        // lets the pump exit and release its handle on the transport
        self.closed.cancel();
    }
}
