//! Message transports carrying encoded frames

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

/// Ordered, reliable transport of whole binary messages.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, message: Bytes) -> io::Result<()>;

    /// Next message, or `None` once the peer has closed.
    async fn receive(&mut self) -> io::Result<Option<Bytes>>;

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: MessageTransport + ?Sized> MessageTransport for Box<T> {
    async fn send(&mut self, message: Bytes) -> io::Result<()> {
        (**self).send(message).await
    }

    async fn receive(&mut self) -> io::Result<Option<Bytes>> {
        (**self).receive().await
    }

    async fn close(&mut self) -> io::Result<()> {
        (**self).close().await
    }
}

/// `LengthDelimitedCodec` that reports a stream ending inside a frame as
/// `UnexpectedEof` instead of a generic error.
#[derive(Debug)]
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
    mid_frame: bool,
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        let mut inner = LengthDelimitedCodec::new();
        inner.set_max_frame_length(max_frame_len);
        Self {
            inner,
            mid_frame: false,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        if !src.is_empty() {
            self.mid_frame = true;
        }
        let frame = self.inner.decode(src)?;
        if frame.is_some() {
            self.mid_frame = !src.is_empty();
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.mid_frame => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame",
            )),
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        self.inner.encode(item, dst)
    }
}

/// Length-delimited messages over a byte stream (TCP, duplex pipe).
pub struct FramedTransport<S> {
    stream: Framed<S, MessageCodec>,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(socket: S, max_frame_len: usize) -> Self {
        Self {
            stream: Framed::new(socket, MessageCodec::new(max_frame_len)),
        }
    }

    /// Raw access to the byte stream, bypassing framing.
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Get the underlying stream (consumes the transport)
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

#[async_trait]
impl<S> MessageTransport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: Bytes) -> io::Result<()> {
        self.stream.send(message).await
    }

    async fn receive(&mut self) -> io::Result<Option<Bytes>> {
        match self.stream.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        SinkExt::<Bytes>::close(&mut self.stream).await
    }
}

/// In-process transport backed by bounded channels.
pub struct MemoryTransport {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

/// Two connected in-memory endpoints.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn send(&mut self, message: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;
        tx.send(message)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
    }

    async fn receive(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}
