//! Shared fixtures: identities, channel pairs and fault-injecting transports.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use crypto::traits::SigningKey;
use crypto::{Fingerprint, IdentityKeypair};
use pq_channel::{
    memory_pair, Channel, ChannelConfig, Frame, MemoryTransport, MessageTransport, SecureChannel,
};
use rand::RngCore;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

pub fn identities() -> (IdentityKeypair, IdentityKeypair) {
    (IdentityKeypair::generate(), IdentityKeypair::generate())
}

/// Handshake both ends over `a`/`b`, each pinning the other.
pub async fn pinned_pair<A, B>(
    a: A,
    b: B,
    alice: &IdentityKeypair,
    bob: &IdentityKeypair,
    config: ChannelConfig,
) -> (Channel<A>, Channel<B>)
where
    A: MessageTransport,
    B: MessageTransport,
{
    let (initiator, responder) = tokio::join!(
        SecureChannel::connect(a, alice, Some(bob.fingerprint()), config.clone()),
        SecureChannel::accept(b, bob, Some(alice.fingerprint()), config)
    );
    (
        initiator.expect("initiator handshake"),
        responder.expect("responder handshake"),
    )
}

pub fn fingerprint_of(identity: &IdentityKeypair) -> Fingerprint {
    identity.fingerprint()
}

/// What a [`FaultyTransport`] does to outgoing frames.
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    /// Silently drop the DATA frame with this sequence number
    DropChunk(u64),
    /// Flip one ciphertext bit of this DATA frame
    FlipChunk(u64),
    /// Send DATA `n + 1` before DATA `n`
    SwapChunks(u64),
    /// Close instead of sending the final DATA frame
    TruncateBeforeFinal,
    /// Flip a bit of the HELLO's classical public value
    CorruptHello,
    /// Replace the first outgoing frame with bytes that do not decode
    Garbage,
    /// Fail with `ConnectionReset` when this incoming DATA frame arrives
    ResetOnReceive(u64),
}

/// Wraps a transport and applies one [`Fault`] on the sending side.
pub struct FaultyTransport<T> {
    inner: T,
    fault: Fault,
    held: Option<Bytes>,
    sent: u64,
}

impl<T: MessageTransport> FaultyTransport<T> {
    pub fn new(inner: T, fault: Fault) -> Self {
        Self {
            inner,
            fault,
            held: None,
            sent: 0,
        }
    }
}

/// A memory pair whose first end misbehaves.
pub fn faulty_pair(fault: Fault) -> (FaultyTransport<MemoryTransport>, MemoryTransport) {
    let (a, b) = memory_pair(256);
    (FaultyTransport::new(a, fault), b)
}

#[async_trait]
impl<T: MessageTransport> MessageTransport for FaultyTransport<T> {
    async fn send(&mut self, message: Bytes) -> io::Result<()> {
        self.sent += 1;
        if matches!(self.fault, Fault::Garbage) && self.sent == 1 {
            return self.inner.send(Bytes::from_static(&[0xee, 1, 2, 3])).await;
        }

        let frame = match Frame::decode(&message, usize::MAX) {
            Ok(frame) => frame,
            Err(_) => return self.inner.send(message).await,
        };
        match (self.fault, frame) {
            (Fault::CorruptHello, Frame::Hello(mut hello)) => {
                hello.classical_public[0] ^= 0x01;
                self.inner.send(Frame::Hello(hello).encode()).await
            }
            (Fault::DropChunk(n), Frame::Data(chunk)) if chunk.sequence_number == n => Ok(()),
            (Fault::FlipChunk(n), Frame::Data(mut chunk)) if chunk.sequence_number == n => {
                chunk.ciphertext[0] ^= 0x01;
                self.inner.send(Frame::Data(chunk).encode()).await
            }
            (Fault::SwapChunks(n), Frame::Data(chunk)) if chunk.sequence_number == n => {
                self.held = Some(message);
                Ok(())
            }
            (Fault::SwapChunks(n), Frame::Data(chunk)) if chunk.sequence_number == n + 1 => {
                self.inner.send(message).await?;
                match self.held.take() {
                    Some(held) => self.inner.send(held).await,
                    None => Ok(()),
                }
            }
            (Fault::TruncateBeforeFinal, Frame::Data(chunk)) if chunk.is_final => {
                self.inner.close().await
            }
            _ => self.inner.send(message).await,
        }
    }

    async fn receive(&mut self) -> io::Result<Option<Bytes>> {
        let message = self.inner.receive().await?;
        if let (Fault::ResetOnReceive(n), Some(bytes)) = (self.fault, &message) {
            if let Ok(Frame::Data(chunk)) = Frame::decode(bytes, usize::MAX) {
                if chunk.sequence_number == n {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    ));
                }
            }
        }
        Ok(message)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }
}

/// Shared buffer for capturing formatted log output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().expect("log buffer lock").clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
