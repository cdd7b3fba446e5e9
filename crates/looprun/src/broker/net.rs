//! Side-channel broker for plugins in another process.
//!
//! Each side hosts its endpoints on ephemeral loopback TCP listeners and
//! announces them to the other side with a `ConnInfo` message on a shared
//! control transport. Dialing waits for the announcement of the requested id
//! and connects to the announced address. Closing a listener withdraws its
//! announcement so the other side forgets the address.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use looprpc::Listener;
use looprpc::StreamTransport;
use looprpc::Transport;
use looprpc::frame::ConnInfo;
use prost::Message;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::Broker;
use super::DialOptions;
use super::Error;

const NETWORK_TCP: &str = "tcp";

pub struct NetBroker {
    control: Arc<dyn Transport>,
    announced: Arc<DashMap<u32, ConnInfo>>,
    notify: Arc<Notify>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl NetBroker {
    /// Starts a broker over `control` and spawns the task reading announcements.
    pub fn new(control: Box<dyn Transport>) -> Self {
        let control: Arc<dyn Transport> = Arc::from(control);
        let announced = Arc::new(DashMap::new());
        let notify = Arc::new(Notify::new());
        let closed = CancellationToken::new();

        tokio::spawn(Self::pump(
            control.clone(),
            announced.clone(),
            notify.clone(),
            closed.clone(),
        ));

        Self {
            control,
            announced,
            notify,
            next_id: AtomicU32::new(0),
            closed,
        }
    }

    pub async fn close(&self) {
        self.closed.cancel();
        self.control.close().await;
        self.notify.notify_waiters();
    }

    async fn pump(
        control: Arc<dyn Transport>,
        announced: Arc<DashMap<u32, ConnInfo>>,
        notify: Arc<Notify>,
        closed: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break,
                next = control.recv() => next,
            };
            match next {
                Ok(Some(message)) => match ConnInfo::decode(message.as_slice()) {
                    Ok(info) if info.withdrawn => {
                        debug!(id = info.service_id, "endpoint withdrawn");
                        announced.remove(&info.service_id);
                    }
                    Ok(info) => {
                        debug!(id = info.service_id, address = %info.address, "endpoint announced");
                        announced.insert(info.service_id, info);
                        notify.notify_waiters();
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed announcement"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "control connection failed");
                    break;
                }
            }
        }
        closed.cancel();
        notify.notify_waiters();
    }

    async fn wait_for(&self, id: u32, options: &DialOptions) -> Result<ConnInfo, Error> {
        let deadline = tokio::time::Instant::now() + options.timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(info) = self.announced.get(&id) {
                return Ok(info.value().clone());
            }
            if self.closed.is_cancelled() {
                return Err(Error::Closed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::DialTimeout { id });
            }
        }
    }
}

#[async_trait::async_trait]
impl Broker for NetBroker {
    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn accept(&self, id: u32) -> Result<Box<dyn Listener>, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let info = ConnInfo {
            service_id: id,
            network: NETWORK_TCP.into(),
            address: address.to_string(),
            withdrawn: false,
        };
        self.control.send(&info.encode_to_vec()).await?;
        debug!(id, %address, "endpoint listening");

        Ok(Box::new(NetListener {
            id,
            listener,
            control: self.control.clone(),
            closed: self.closed.child_token(),
        }))
    }

    async fn dial(&self, id: u32, options: &DialOptions) -> Result<Box<dyn Transport>, Error> {
        let info = self.wait_for(id, options).await?;
        if info.network != NETWORK_TCP {
            return Err(Error::Io(format!(
                "endpoint {id} announced unsupported network {:?}",
                info.network
            )));
        }
        let stream = match TcpStream::connect(&info.address).await {
            Ok(stream) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(Error::ConnectionRefused { id });
            }
            Err(e) => return Err(e.into()),
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(StreamTransport::new(stream)))
    }
}

struct NetListener {
    id: u32,
    listener: TcpListener,
    control: Arc<dyn Transport>,
    closed: CancellationToken,
}

#[async_trait::async_trait]
impl Listener for NetListener {
    async fn accept(&self) -> Option<Box<dyn Transport>> {
        let accepted = tokio::select! {
            _ = self.closed.cancelled() => return None,
            accepted = self.listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted endpoint connection");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "could not disable nagle");
                }
                Some(Box::new(StreamTransport::new(stream)))
            }
            Err(e) => {
                warn!(error = %e, "endpoint listener failed");
                None
            }
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let withdrawal = ConnInfo {
            service_id: self.id,
            withdrawn: true,
            ..ConnInfo::default()
        };
        if let Err(e) = self.control.send(&withdrawal.encode_to_vec()).await {
            debug!(id = self.id, error = %e, "could not withdraw endpoint");
        }
    }
}
