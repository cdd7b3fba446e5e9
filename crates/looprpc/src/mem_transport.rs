//! In-process duplex transport built on tokio mpsc channels.
//!
//! Used by the in-memory broker and throughout the test suites. Messages sent
//! on one end appear on the other end's `recv` and vice versa.

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport;
use crate::transport::Transport;

pub struct MemTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
}

impl MemTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
            closed: CancellationToken::new(),
        };

        let b = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
            closed: CancellationToken::new(),
        };

        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for MemTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self.tx.lock().await;
        let Some(tx) = tx.as_ref() else {
            return Err(transport::Error::Closed);
        };
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("other end dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        if self.closed.is_cancelled() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            msg = rx.recv() => Ok(msg),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        // dropping the sender is what the other end observes
        self.tx.lock().await.take();
        self.rx.lock().await.close();
    }
}
