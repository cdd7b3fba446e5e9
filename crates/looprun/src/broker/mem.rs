//! In-process broker. Endpoints live in an `Exchange`; dialing an id hands
//! one half of a fresh `MemTransport` pair to the listener registered there.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use looprpc::Listener;
use looprpc::MemTransport;
use looprpc::Transport;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::Broker;
use super::DialOptions;
use super::Error;

type Incoming = mpsc::UnboundedSender<Box<dyn Transport>>;

/// Endpoints hosted by one side.
#[derive(Default)]
struct Exchange {
    listeners: DashMap<u32, Incoming>,
    announced: Notify,
}

impl Exchange {
    fn unregister(&self, id: u32, tx: &Incoming) {
        self.listeners
            .remove_if(&id, |_, registered| registered.same_channel(tx));
    }
}

pub struct MemBroker {
    local: Arc<Exchange>,
    remote: Arc<Exchange>,
    next_id: AtomicU32,
}

impl MemBroker {
    /// A loopback broker: what it accepts, it can dial.
    pub fn new() -> Self {
        let exchange = Arc::new(Exchange::default());
        Self {
            local: exchange.clone(),
            remote: exchange,
            next_id: AtomicU32::new(0),
        }
    }

    /// Two linked brokers: each one dials what the other accepts.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Exchange::default());
        let b = Arc::new(Exchange::default());
        let host = Self {
            local: a.clone(),
            remote: b.clone(),
            next_id: AtomicU32::new(0),
        };
        let plugin = Self {
            local: b,
            remote: a,
            next_id: AtomicU32::new(0),
        };
        (host, plugin)
    }
}

impl Default for MemBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for MemBroker {
    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn accept(&self, id: u32) -> Result<Box<dyn Listener>, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.local.listeners.entry(id) {
            Entry::Occupied(_) => return Err(Error::AlreadyServing { id }),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }
        self.local.announced.notify_waiters();
        trace!(id, "endpoint listening");

        Ok(Box::new(MemListener {
            id,
            tx,
            rx: Mutex::new(rx),
            exchange: self.local.clone(),
            closed: CancellationToken::new(),
        }))
    }

    async fn dial(&self, id: u32, options: &DialOptions) -> Result<Box<dyn Transport>, Error> {
        let deadline = tokio::time::Instant::now() + options.timeout;
        loop {
            // registered before the lookup so an accept in between still wakes us
            let announced = self.remote.announced.notified();
            tokio::pin!(announced);
            announced.as_mut().enable();

            let incoming = self.remote.listeners.get(&id).map(|e| e.value().clone());
            if let Some(incoming) = incoming {
                let (client, server) = MemTransport::pair();
                incoming
                    .send(Box::new(server))
                    .map_err(|_| Error::ConnectionRefused { id })?;
                return Ok(Box::new(client));
            }

            if tokio::time::timeout_at(deadline, announced).await.is_err() {
                return Err(Error::DialTimeout { id });
            }
        }
    }
}

struct MemListener {
    id: u32,
    tx: Incoming,
    rx: Mutex<mpsc::UnboundedReceiver<Box<dyn Transport>>>,
    exchange: Arc<Exchange>,
    closed: CancellationToken,
}

#[async_trait::async_trait]
impl Listener for MemListener {
    async fn accept(&self) -> Option<Box<dyn Transport>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            next = rx.recv() => next,
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.exchange.unregister(self.id, &self.tx);
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        self.exchange.unregister(self.id, &self.tx);
    }
}
