//! # Endpoint Broker
//!
//! The broker hands out endpoint ids and turns them into connections: the
//! serving side calls `accept(id)` to host a new logical endpoint, the other
//! side calls `dial(id)` to reach it. Ids travel out of band, usually as the
//! return value of an RPC that asked the remote side to serve something.
//!
//! ## Invariants
//!
//! - `next_id` is strictly increasing within one broker, starting at 1, and an
//!   id is never handed out twice.
//! - A dial waits at most `DialOptions::timeout` for the matching accept.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use looprpc::Listener;
use looprpc::Transport;

pub mod mem;
pub mod net;

pub use mem::MemBroker;
pub use net::NetBroker;

/// Default bound on how long a dial waits for its accept.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("broker closed")]
    Closed,
    #[error("timed out waiting for endpoint {id}")]
    DialTimeout { id: u32 },
    #[error("endpoint {id} refused the connection")]
    ConnectionRefused { id: u32 },
    #[error("endpoint {id} is already being served")]
    AlreadyServing { id: u32 },
    #[error("i/o error: {0}")]
    Io(String),
    #[error(transparent)]
    Transport(#[from] looprpc::transport::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Allocates a fresh endpoint id.
    fn next_id(&self) -> u32;

    /// Starts hosting endpoint `id`.
    async fn accept(&self, id: u32) -> Result<Box<dyn Listener>, Error>;

    /// Opens a connection to endpoint `id` served by the other side.
    async fn dial(&self, id: u32, options: &DialOptions) -> Result<Box<dyn Transport>, Error>;
}

#[async_trait::async_trait]
impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn next_id(&self) -> u32 {
        (**self).next_id()
    }

    async fn accept(&self, id: u32) -> Result<Box<dyn Listener>, Error> {
        (**self).accept(id).await
    }

    async fn dial(&self, id: u32, options: &DialOptions) -> Result<Box<dyn Transport>, Error> {
        (**self).dial(id, options).await
    }
}

/// A broker that can be replaced while in use.
///
/// Every operation loads the current broker first, so a `store` takes effect
/// for the next call on any task. Operations already running finish on the
/// broker they started with.
pub struct SwapBroker {
    current: ArcSwap<Arc<dyn Broker>>,
}

impl SwapBroker {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            current: ArcSwap::from_pointee(broker),
        }
    }

    pub fn load(&self) -> Arc<dyn Broker> {
        let guard = self.current.load();
        Arc::clone(&**guard)
    }

    pub fn store(&self, broker: Arc<dyn Broker>) {
        self.current.store(Arc::new(broker));
    }
}

#[async_trait::async_trait]
impl Broker for SwapBroker {
    fn next_id(&self) -> u32 {
        self.load().next_id()
    }

    async fn accept(&self, id: u32) -> Result<Box<dyn Listener>, Error> {
        let broker = self.load();
        broker.accept(id).await
    }

    async fn dial(&self, id: u32, options: &DialOptions) -> Result<Box<dyn Transport>, Error> {
        let broker = self.load();
        broker.dial(id, options).await
    }
}
