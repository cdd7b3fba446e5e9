//! # RPC Server
//!
//! Serves a `Service` on every connection a `Listener` yields.
//!
//! ## Invariants
//!
//! - Calls on one connection run concurrently, one task each.
//! - A handler's context is cancelled only by the caller: its deadline passing
//!   or its `Cancel` frame. When the connection ends or the server stops, running
//!   handlers are dropped and send no reply, so the caller sees the connection
//!   loss (`Unavailable`) rather than a cancellation it never asked for.
//! - `serve` returns only after every connection task has finished and every
//!   connection transport has been closed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::context::Context;
use crate::frame::CallFrame;
use crate::frame::Frame;
use crate::frame::Kind;
use crate::service::Request;
use crate::service::Service;
use crate::service::StreamSink;
use crate::status::Status;
use crate::transport::Transport;

/// Source of inbound connections for one endpoint.
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Waits for the next connection; `None` once the listener is closed.
    async fn accept(&self) -> Option<Box<dyn Transport>>;

    /// Stops accepting. Idempotent.
    async fn close(&self);
}

pub struct Server {
    name: String,
    service: Arc<dyn Service>,
}

impl Server {
    pub fn new(name: impl Into<String>, service: impl Service) -> Self {
        Self {
            name: name.into(),
            service: Arc::new(service),
        }
    }

    pub fn from_shared(name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        Self {
            name: name.into(),
            service,
        }
    }

    /// Accepts and serves connections until `stop` fires or the listener closes.
    pub async fn serve(&self, listener: Box<dyn Listener>, stop: CancellationToken) {
        let conns_stop = stop.child_token();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(server = %self.name, error = %e, "connection task failed");
                    }
                }
                next = listener.accept() => match next {
                    Some(transport) => {
                        debug!(server = %self.name, "accepted connection");
                        connections.spawn(serve_connection(
                            self.name.clone(),
                            Arc::from(transport),
                            self.service.clone(),
                            conns_stop.child_token(),
                        ));
                    }
                    None => break,
                },
            }
        }

        listener.close().await;
        conns_stop.cancel();
        while connections.join_next().await.is_some() {}
        debug!(server = %self.name, "server stopped");
    }
}

/// Serves one connection until it ends or `stop` fires.
pub async fn serve_connection(
    name: String,
    transport: Arc<dyn Transport>,
    service: Arc<dyn Service>,
    stop: CancellationToken,
) {
    let inflight: Arc<DashMap<u64, CancellationToken>> = Arc::new(DashMap::new());
    let mut calls = JoinSet::new();

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = calls.join_next(), if !calls.is_empty() => continue,
            next = transport.recv() => next,
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                debug!(server = %name, error = %e, "connection failed");
                break;
            }
        };

        match Frame::from_bytes(&message) {
            Ok(Kind::Call(call)) => {
                let token = CancellationToken::new();
                inflight.insert(call.seq, token.clone());
                calls.spawn(handle_call(
                    call,
                    token,
                    service.clone(),
                    transport.clone(),
                    inflight.clone(),
                ));
            }
            Ok(Kind::Cancel(cancel)) => {
                if let Some((_, token)) = inflight.remove(&cancel.seq) {
                    token.cancel();
                }
            }
            Ok(Kind::Reply(_)) | Ok(Kind::StreamItem(_)) => {
                warn!(server = %name, "server received a client-bound frame");
                break;
            }
            Err(status) => {
                warn!(server = %name, error = %status, "dropping connection after bad frame");
                break;
            }
        }
    }

    calls.abort_all();
    while calls.join_next().await.is_some() {}
    transport.close().await;
}

async fn handle_call(
    call: CallFrame,
    token: CancellationToken,
    service: Arc<dyn Service>,
    transport: Arc<dyn Transport>,
    inflight: Arc<DashMap<u64, CancellationToken>>,
) {
    let seq = call.seq;
    let mut ctx = Context::from_token(token);
    if call.timeout_ms > 0 {
        ctx = ctx.with_timeout(Duration::from_millis(call.timeout_ms));
    }
    let request = Request {
        method: call.method,
        metadata: call.metadata.into(),
        payload: call.payload,
    };

    let result = if call.streaming {
        run_stream(&ctx, seq, request, service.as_ref(), transport.as_ref())
            .await
            .map(|()| Vec::new())
    } else {
        match ctx.run(service.call(ctx.clone(), request)).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        }
    };

    inflight.remove(&seq);
    if let Err(e) = transport.send(&Frame::reply(seq, result).to_bytes()).await {
        debug!(seq, error = %e, "could not deliver reply");
    }
}

/// Runs a streaming handler, forwarding its messages as they are produced.
async fn run_stream(
    ctx: &Context,
    seq: u64,
    request: Request,
    service: &dyn Service,
    transport: &dyn Transport,
) -> Result<(), Status> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = service.stream(ctx.clone(), request, StreamSink::new(tx));
    tokio::pin!(handler);

    let outcome = loop {
        tokio::select! {
            e = ctx.done() => break Err(Status::from(e)),
            res = &mut handler => break res,
            Some(item) = rx.recv() => {
                if let Err(e) = transport.send(&Frame::stream_item(seq, item).to_bytes()).await {
                    break Err(Status::unavailable(e.to_string()));
                }
            }
        }
    };

    // messages written right before the handler returned
    while let Ok(item) = rx.try_recv() {
        transport
            .send(&Frame::stream_item(seq, item).to_bytes())
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
    }

    outcome
}
