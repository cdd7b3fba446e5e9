//! Length-delimited message transport over any byte stream (TCP, unix
//! sockets, `tokio::io::duplex`).

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;

use crate::transport;
use crate::transport::Transport;

/// Upper bound for a single message on the wire.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

pub struct StreamTransport<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>,
    closed: CancellationToken,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(read_half, codec())),
            writer: Mutex::new(FramedWrite::new(write_half, codec())),
            closed: CancellationToken::new(),
        }
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_LEN)
        .new_codec()
}

#[async_trait::async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if self.closed.is_cancelled() {
            return Err(transport::Error::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                    transport::Error::ConnectionLost(e.to_string())
                }
                _ => transport::Error::Io(e.to_string()),
            })
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        if self.closed.is_cancelled() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            next = reader.next() => match next {
                Some(Ok(message)) => Ok(Some(message.to_vec())),
                Some(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
                Some(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    Err(transport::Error::ConnectionLost(e.to_string()))
                }
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        // shuts down the write half so the other end reads end-of-stream
        let _ = SinkExt::<Bytes>::close(&mut *writer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_keep_their_boundaries() {
        let (left, right) = tokio::io::duplex(1024);
        let a = StreamTransport::new(left);
        let b = StreamTransport::new(right);

        a.send(b"first").await.expect("send");
        a.send(b"").await.expect("send empty");
        a.send(b"third").await.expect("send");

        assert_eq!(b.recv().await.expect("recv"), Some(b"first".to_vec()));
        assert_eq!(b.recv().await.expect("recv"), Some(Vec::new()));
        assert_eq!(b.recv().await.expect("recv"), Some(b"third".to_vec()));
    }

    #[tokio::test]
    async fn test_close_is_seen_as_end_of_stream() {
        let (left, right) = tokio::io::duplex(1024);
        let a = StreamTransport::new(left);
        let b = StreamTransport::new(right);

        a.close().await;
        assert_eq!(b.recv().await.expect("recv"), None);
        assert!(matches!(a.send(b"late").await, Err(transport::Error::Closed)));
    }
}
