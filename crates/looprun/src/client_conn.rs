//! # Self-Healing Client Connection
//!
//! `ClientConn` looks like one long-lived connection to its callers. Under the
//! hood it holds one generation at a time: a dialed `Peer` plus the resources
//! that were set up for it. When a call fails because the generation's
//! connection is dead, the generation is torn down and a fresh one is built by
//! the caller-supplied rebuild function, retrying under exponential backoff
//! until it works or the caller gives up.
//!
//! ## Invariants
//!
//! - Reads of the active generation never lock.
//! - At most one rebuild runs at a time. A caller only tears down the
//!   generation it saw fail; if someone else already replaced it, the caller
//!   retries on the replacement.
//! - A call whose context is cancelled or expired returns the context error
//!   and never starts or continues a rebuild.
//! - Failures of `/Close` methods are returned as-is; nothing is rebuilt just
//!   to close it.
//! - Dependency resources belong to exactly one generation and are released
//!   together with it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwapOption;
use arc_swap::Guard;
use looprpc::Context;
use looprpc::Invoker;
use looprpc::Metadata;
use looprpc::Peer;
use looprpc::Status;
use looprpc::Streaming;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::ext::BrokerExt;
use crate::resource::Resources;

/// Method name every service uses for its explicit close call.
pub const CLOSE_METHOD: &str = "Close";

/// True for `/package.Service/Close`.
pub fn is_close_method(method: &str) -> bool {
    looprpc::service::split_method(method).is_some_and(|(_, name)| name == CLOSE_METHOD)
}

pub type RebuildFuture = Pin<Box<dyn Future<Output = anyhow::Result<(u32, Resources)>> + Send>>;
pub type RebuildFn = Arc<dyn Fn(Context) -> RebuildFuture + Send + Sync>;

/// One dialed connection and what was set up for it.
struct Generation {
    id: u32,
    peer: Peer,
    deps: Resources,
}

pub struct ClientConn {
    ext: BrokerExt,
    rebuild: RebuildFn,
    active: ArcSwapOption<Generation>,
    rebuild_lock: Mutex<()>,
    closed: CancellationToken,
    attempts: AtomicU64,
}

impl ClientConn {
    pub fn new<F, Fut>(ext: BrokerExt, rebuild: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<(u32, Resources)>> + Send + 'static,
    {
        Self {
            ext,
            rebuild: Arc::new(move |ctx| Box::pin(rebuild(ctx)) as RebuildFuture),
            active: ArcSwapOption::empty(),
            rebuild_lock: Mutex::new(()),
            closed: CancellationToken::new(),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.ext.name()
    }

    /// Number of times the rebuild function has been invoked, including the
    /// initial connect.
    pub fn rebuild_count(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Endpoint id of the active generation.
    pub fn active_id(&self) -> Option<u32> {
        self.active.load_full().map(|generation| generation.id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Releases the active generation. Every later call fails with
    /// `Unavailable` and no rebuild is attempted.
    pub async fn close(&self) {
        self.closed.cancel();
        // a rebuild in flight notices `closed` and installs nothing more
        let _guard = self.rebuild_lock.lock().await;
        if let Some(generation) = self.active.swap(None) {
            self.teardown(&generation).await;
        }
        debug!(logger = %self.ext.name(), "client connection closed");
    }

    fn closed_status(&self) -> Status {
        Status::unavailable(format!("{}: client connection closed", self.ext.name()))
    }

    async fn connection(&self, ctx: &Context) -> Result<Arc<Generation>, Status> {
        if self.is_closed() {
            return Err(self.closed_status());
        }
        match self.active.load_full() {
            Some(generation) => Ok(generation),
            None => self.refresh(ctx, None).await,
        }
    }

    /// Decides what to do with a failed call: `Ok` means rebuild and retry,
    /// `Err` is what the caller gets.
    fn classify(&self, ctx: &Context, method: &str, status: Status) -> Result<(), Status> {
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }
        // a remote Cancelled/DeadlineExceeded under a live context is the
        // server's own answer, returned like any other non-terminal status
        if is_close_method(method) || !status.is_terminal() {
            return Err(status);
        }
        if self.is_closed() {
            return Err(self.closed_status());
        }
        Ok(())
    }

    /// Replaces `seen` (the generation the caller watched fail) with a new one.
    async fn refresh(&self, ctx: &Context, seen: Option<&Arc<Generation>>) -> Result<Arc<Generation>, Status> {
        let _guard = ctx.run(self.rebuild_lock.lock()).await?;
        if self.is_closed() {
            return Err(self.closed_status());
        }

        let seen = seen.cloned();
        let previous = Guard::into_inner(self.active.compare_and_swap(&seen, None::<Arc<Generation>>));
        let swapped = match (&previous, &seen) {
            (Some(current), Some(seen)) => Arc::ptr_eq(current, seen),
            (None, None) => true,
            _ => false,
        };
        if swapped {
            if let Some(dead) = &seen {
                debug!(logger = %self.ext.name(), id = dead.id, "tearing down dead connection");
                self.teardown(dead).await;
            }
        } else if let Some(current) = previous {
            // someone else rebuilt while we waited for the lock
            return Ok(current);
        }

        self.rebuild_loop(ctx).await
    }

    async fn rebuild_loop(&self, ctx: &Context) -> Result<Arc<Generation>, Status> {
        let policy = &self.ext.config().retry;
        let mut attempt: u32 = 0;
        loop {
            if let Some(e) = ctx.err() {
                return Err(e.into());
            }
            if self.is_closed() {
                return Err(self.closed_status());
            }

            attempt = attempt.saturating_add(1);
            self.attempts.fetch_add(1, Ordering::SeqCst);
            // only the rebuild function is abandoned on cancellation; once it has
            // handed over resources they are either installed or released
            let built = match ctx.run((self.rebuild)(ctx.clone())).await? {
                Ok((id, deps)) => self.dial_generation(id, deps).await,
                Err(e) => Err(e),
            };
            match built {
                Ok(generation) => {
                    let generation = Arc::new(generation);
                    self.active.store(Some(generation.clone()));
                    info!(logger = %self.ext.name(), id = generation.id, attempt, "client connection established");
                    return Ok(generation);
                }
                Err(e) => {
                    warn!(logger = %self.ext.name(), attempt, error = %format!("{e:#}"), "failed to rebuild client connection");
                }
            }

            let delay = policy.backoff_for_attempt(attempt);
            tokio::select! {
                slept = ctx.run(tokio::time::sleep(delay)) => slept?,
                _ = self.closed.cancelled() => return Err(self.closed_status()),
            }
        }
    }

    async fn dial_generation(&self, id: u32, deps: Resources) -> anyhow::Result<Generation> {
        match self.ext.dial(id).await {
            Ok(peer) => Ok(Generation { id, peer, deps }),
            Err(e) => {
                self.ext.close_all(deps).await;
                Err(e.into())
            }
        }
    }

    async fn teardown(&self, generation: &Generation) {
        generation.peer.close().await;
        self.ext.close_all(generation.deps.clone()).await;
    }
}

#[async_trait::async_trait]
impl Invoker for ClientConn {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        let mut generation = self.connection(ctx).await?;
        loop {
            match generation
                .peer
                .invoke(ctx, method, metadata.clone(), payload.clone())
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(status) => {
                    self.classify(ctx, method, status)?;
                    generation = self.refresh(ctx, Some(&generation)).await?;
                }
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
        let mut generation = self.connection(ctx).await?;
        loop {
            match generation
                .peer
                .open_stream(ctx, method, metadata.clone(), payload.clone())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(status) => {
                    self.classify(ctx, method, status)?;
                    generation = self.refresh(ctx, Some(&generation)).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_method_detection() {
        assert!(is_close_method("/loop.Relayer/Close"));
        assert!(is_close_method("/loop.ContractReader/Close"));
        assert!(!is_close_method("/loop.Relayer/CloseAll"));
        assert!(!is_close_method("/loop.Relayer/Ready"));
        assert!(!is_close_method("Close"));
    }
}
