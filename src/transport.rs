//! Frame-oriented byte transports the client and server run over.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::errors::PortError;

/// Reliable, ordered delivery of whole frames.
///
/// `receive_frame` must be cancel safe: the serve and client loops poll it
/// inside `tokio::select!`.
#[async_trait]
pub trait FrameTransport: Send + 'static {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), PortError>;

    /// `Ok(None)` once the peer has closed the transport.
    async fn receive_frame(&mut self) -> Result<Option<Bytes>, PortError>;
}

#[async_trait]
impl<T> FrameTransport for Box<T>
where
    T: FrameTransport + ?Sized,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), PortError> {
        (**self).send_frame(frame).await
    }

    async fn receive_frame(&mut self) -> Result<Option<Bytes>, PortError> {
        (**self).receive_frame().await
    }
}

/// In-process transport, one half of [`memory_pair`].
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Two connected in-memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), PortError> {
        self.tx.send(frame).map_err(|_| PortError::ConnectionClosed)
    }

    async fn receive_frame(&mut self) -> Result<Option<Bytes>, PortError> {
        Ok(self.rx.recv().await)
    }
}

/// Length-prefixed frames over any async byte stream (TCP, Unix sockets,
/// `tokio::io::duplex`).
#[derive(Debug)]
pub struct FramedTransport<T> {
    inner: Framed<T, LengthDelimitedCodec>,
}

impl<T> FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: T, max_frame_length: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec();
        Self {
            inner: Framed::new(io, codec),
        }
    }
}

#[async_trait]
impl<T> FrameTransport for FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), PortError> {
        self.inner.send(frame).await?;
        Ok(())
    }

    async fn receive_frame(&mut self) -> Result<Option<Bytes>, PortError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(PortError::IoError(e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_delivers_in_order() {
        let (mut a, mut b) = memory_pair();
        a.send_frame(Bytes::from_static(b"one")).await.unwrap();
        a.send_frame(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(b.receive_frame().await.unwrap().unwrap(), "one");
        assert_eq!(b.receive_frame().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn memory_transport_reports_closed_peer() {
        let (mut a, b) = memory_pair();
        drop(b);
        assert!(matches!(
            a.send_frame(Bytes::from_static(b"x")).await,
            Err(PortError::ConnectionClosed)
        ));
        assert!(a.receive_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn framed_transport_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let mut client = FramedTransport::new(left, 1024);
        let mut server = FramedTransport::new(right, 1024);

        client
            .send_frame(Bytes::from_static(b"{\"type\":\"cancel\"}"))
            .await
            .unwrap();
        let frame = server.receive_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"{\"type\":\"cancel\"}");

        drop(client);
        assert!(server.receive_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (left, right) = tokio::io::duplex(4096);
        let mut client = FramedTransport::new(left, 4096);
        let mut server = FramedTransport::new(right, 8);

        client
            .send_frame(Bytes::from(vec![b'x'; 64]))
            .await
            .unwrap();
        assert!(matches!(
            server.receive_frame().await,
            Err(PortError::IoError(_))
        ));
    }
}
