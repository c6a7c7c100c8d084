//! Secure channel: hybrid handshake followed by one streamed transfer.
//!
//! ```text
//! initiator                                responder
//!   HELLO     {x25519_pub, mlkem_pub}   ->
//!             <-  RESPONSE {x25519_pub, mlkem_ct}
//!   IDENTITY  {id_pub, sig, confirm}    <->  IDENTITY
//!   START     {sealed offer}            ->
//!             <-  ACCEPT
//!   DATA 0 .. DATA n (final)            ->
//!             <-  ACK {total_size, digest}
//! ```
//!
//! Either side may send ABORT at any point; the channel is then unusable.
//! Handshake frames are capped at [`HANDSHAKE_FRAME_LIMIT`] whatever the
//! configured chunk size.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use crypto::{Fingerprint, IdentityKeypair, IdentityPublicKey};
use subtle::ConstantTimeEq;
use tokio::io::AsyncRead;
use tokio::time::timeout;

use crate::config::ChannelConfig;
use crate::error::{ChannelError, HandshakeError, Result};
use crate::handshake::{identity_proof, verify_identity_proof, HandshakeState, HybridKeyExchange};
use crate::progress::TransferProgress;
use crate::session::Session;
use crate::sink::ChunkSink;
use crate::stream::{
    open_offer, seal_offer, ChunkReader, StreamOpener, StreamSealer, TransferManifest,
};
use crate::transport::MessageTransport;
use crate::types::{
    AbortReason, Frame, HelloFrame, Receipt, ResponseFrame, Role, TransferOffer,
    HANDSHAKE_FRAME_LIMIT, PROTOCOL_VERSION,
};

const ABORT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Handshaking,
    Ready,
    Transferring,
    Complete,
    Failed,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Handshaking => "HANDSHAKING",
            ChannelState::Ready => "READY",
            ChannelState::Transferring => "TRANSFERRING",
            ChannelState::Complete => "COMPLETE",
            ChannelState::Failed => "FAILED",
            ChannelState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Entry points for establishing a [`Channel`].
pub struct SecureChannel;

impl SecureChannel {
    /// Run the handshake as initiator.
    ///
    /// With `expected_peer` set, a peer whose identity fingerprint differs is
    /// rejected with [`HandshakeError::PeerIdentityMismatch`] even though the
    /// key exchange itself succeeded.
    pub async fn connect<T: MessageTransport>(
        transport: T,
        identity: &IdentityKeypair,
        expected_peer: Option<Fingerprint>,
        config: ChannelConfig,
    ) -> Result<Channel<T>> {
        establish(transport, Role::Initiator, identity, expected_peer, config).await
    }

    /// Run the handshake as responder.
    pub async fn accept<T: MessageTransport>(
        transport: T,
        identity: &IdentityKeypair,
        expected_peer: Option<Fingerprint>,
        config: ChannelConfig,
    ) -> Result<Channel<T>> {
        establish(transport, Role::Responder, identity, expected_peer, config).await
    }
}

async fn establish<T: MessageTransport>(
    mut transport: T,
    role: Role,
    identity: &IdentityKeypair,
    expected_peer: Option<Fingerprint>,
    config: ChannelConfig,
) -> Result<Channel<T>> {
    config.validate()?;
    let mut session = Session::new(role);

    let outcome = timeout(
        config.handshake_timeout(),
        run_handshake(&mut transport, &mut session, identity, &config),
    )
    .await;
    let peer = match outcome {
        Ok(Ok(peer)) => peer,
        Ok(Err(err)) => return Err(fail_handshake(&mut transport, &mut session, err).await),
        Err(_) => {
            return Err(fail_handshake(&mut transport, &mut session, ChannelError::Timeout).await)
        }
    };

    let peer_fingerprint = peer.fingerprint();
    if let Some(expected) = expected_peer {
        if expected != peer_fingerprint {
            let err = HandshakeError::PeerIdentityMismatch {
                expected,
                actual: peer_fingerprint,
            };
            return Err(fail_handshake(&mut transport, &mut session, err.into()).await);
        }
    }
    session.activate(peer_fingerprint)?;

    tracing::info!(
        %role,
        peer = %peer_fingerprint.short(),
        session = %session.session_id().map(hex::encode).unwrap_or_default(),
        "secure channel established"
    );

    Ok(Channel {
        transport,
        session,
        state: ChannelState::Ready,
        config,
        peer,
        offer: None,
        progress: None,
    })
}

async fn run_handshake<T: MessageTransport>(
    transport: &mut T,
    session: &mut Session,
    identity: &IdentityKeypair,
    config: &ChannelConfig,
) -> Result<IdentityPublicKey> {
    let max_frame = HANDSHAKE_FRAME_LIMIT;
    let verbose = config.verbose_logging;

    match session.role() {
        Role::Initiator => {
            let (classical_public, kem_public, ephemeral) = HybridKeyExchange::initiate();
            let hello = Frame::Hello(HelloFrame {
                version: PROTOCOL_VERSION,
                classical_public: classical_public.to_vec(),
                kem_public,
            });
            transport.send(hello.encode()).await?;
            session.advance(HandshakeState::SentHello)?;
            if verbose {
                tracing::debug!("sent HELLO");
            }

            let response = match expect_handshake_frame(transport, max_frame).await? {
                Frame::Response(response) => response,
                other => return Err(unexpected("RESPONSE", &other)),
            };
            check_version(response.version)?;
            session.advance(HandshakeState::ReceivedResponse)?;
            if verbose {
                tracing::debug!("received RESPONSE");
            }

            let keys = HybridKeyExchange::finish(
                ephemeral,
                &response.classical_public,
                &response.kem_ciphertext,
            )?;
            session.install_keys(keys)?;
        }
        Role::Responder => {
            let hello = match expect_handshake_frame(transport, max_frame).await? {
                Frame::Hello(hello) => hello,
                other => return Err(unexpected("HELLO", &other)),
            };
            check_version(hello.version)?;
            session.advance(HandshakeState::SentHello)?;
            if verbose {
                tracing::debug!("received HELLO");
            }

            let (classical_public, kem_ciphertext, keys) =
                HybridKeyExchange::respond(&hello.classical_public, &hello.kem_public)?;
            let response = Frame::Response(ResponseFrame {
                version: PROTOCOL_VERSION,
                classical_public: classical_public.to_vec(),
                kem_ciphertext,
            });
            transport.send(response.encode()).await?;
            session.advance(HandshakeState::ReceivedResponse)?;
            if verbose {
                tracing::debug!("sent RESPONSE");
            }
            session.install_keys(keys)?;
        }
    }

    let role = session.role();
    let proof = identity_proof(identity, session.keys()?, role);
    transport.send(Frame::Identity(proof).encode()).await?;

    let peer_proof = match expect_handshake_frame(transport, max_frame).await? {
        Frame::Identity(proof) => proof,
        other => return Err(unexpected("IDENTITY", &other)),
    };
    let peer = verify_identity_proof(&peer_proof, session.keys()?, role.peer())?;
    if verbose {
        tracing::debug!(peer = %peer.fingerprint().short(), "verified peer IDENTITY");
    }
    Ok(peer)
}

fn check_version(remote: u8) -> std::result::Result<(), HandshakeError> {
    if remote != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote,
        });
    }
    Ok(())
}

fn unexpected(expected: &'static str, frame: &Frame) -> ChannelError {
    HandshakeError::UnexpectedMessage {
        expected,
        got: frame.frame_type(),
    }
    .into()
}

async fn receive_frame<T: MessageTransport + ?Sized>(
    transport: &mut T,
    max_frame: usize,
) -> Result<Option<Frame>> {
    match transport.receive().await? {
        Some(bytes) => Ok(Some(Frame::decode(&bytes, max_frame)?)),
        None => Ok(None),
    }
}

async fn expect_handshake_frame<T: MessageTransport + ?Sized>(
    transport: &mut T,
    max_frame: usize,
) -> Result<Frame> {
    match receive_frame(transport, max_frame).await? {
        Some(Frame::Abort(reason)) => Err(HandshakeError::Aborted(reason).into()),
        Some(frame) => Ok(frame),
        None => Err(HandshakeError::ConnectionClosed.into()),
    }
}

async fn fail_handshake<T: MessageTransport + ?Sized>(
    transport: &mut T,
    session: &mut Session,
    err: ChannelError,
) -> ChannelError {
    session.fail();
    tracing::warn!(role = %session.role(), error = %err, "handshake failed");
    if !peer_already_gone(&err) {
        send_abort(transport, err.abort_reason()).await;
    }
    err
}

/// Errors after which an ABORT would go nowhere or echo the peer's own.
fn peer_already_gone(err: &ChannelError) -> bool {
    matches!(
        err,
        ChannelError::PeerAborted(_)
            | ChannelError::ConnectionClosed
            | ChannelError::Io(_)
            | ChannelError::Handshake(HandshakeError::Aborted(_))
            | ChannelError::Handshake(HandshakeError::ConnectionClosed)
    )
}

/// Transport errors meaning the peer's end went away.
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Whatever the peer sends while we are still streaming ends the transfer.
fn interrupted_send(incoming: io::Result<Option<Bytes>>, max_frame: usize) -> ChannelError {
    match incoming {
        Ok(Some(bytes)) => match Frame::decode(&bytes, max_frame) {
            Ok(Frame::Abort(reason)) => ChannelError::PeerAborted(reason),
            Ok(other) => ChannelError::UnexpectedFrame(other.frame_type()),
            Err(e) => e.into(),
        },
        Ok(None) => ChannelError::ConnectionClosed,
        Err(e) => e.into(),
    }
}

async fn send_abort<T: MessageTransport + ?Sized>(transport: &mut T, reason: AbortReason) {
    match timeout(ABORT_SEND_TIMEOUT, transport.send(Frame::Abort(reason).encode())).await {
        Ok(Ok(())) => tracing::debug!(%reason, "sent ABORT"),
        Ok(Err(e)) => tracing::debug!(%reason, error = %e, "could not deliver ABORT"),
        Err(_) => tracing::debug!(%reason, "timed out delivering ABORT"),
    }
}

/// An established channel carrying at most one transfer.
pub struct Channel<T> {
    transport: T,
    session: Session,
    state: ChannelState,
    config: ChannelConfig,
    peer: IdentityPublicKey,
    offer: Option<TransferOffer>,
    progress: Option<TransferProgress>,
}

impl<T> Channel<T> {
    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.peer.fingerprint()
    }

    pub fn peer_identity(&self) -> &IdentityPublicKey {
        &self.peer
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> Option<[u8; 16]> {
        self.session.session_id()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The offer this channel sent or received, once the START frame passed.
    pub fn offer(&self) -> Option<&TransferOffer> {
        self.offer.as_ref()
    }

    /// Counts for the transfer so far, including a failed one.
    pub fn progress(&self) -> Option<&TransferProgress> {
        self.progress.as_ref()
    }

    fn fail(&mut self) {
        self.state = ChannelState::Failed;
        self.session.fail();
    }

    fn begin_transfer(&mut self) -> Result<()> {
        if self.state != ChannelState::Ready {
            return Err(ChannelError::ChannelUnusable(self.state));
        }
        self.state = ChannelState::Transferring;
        Ok(())
    }
}

impl<T: MessageTransport> Channel<T> {
    /// Seal `source` chunk by chunk and send it; with `await_receipt`, wait
    /// for the receiver's ACK and check it against what was sent.
    pub async fn send_stream<R>(&mut self, source: R) -> Result<TransferManifest>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.send_offered(TransferOffer::default(), source).await
    }

    /// Like [`send_stream`](Self::send_stream), announcing `offer` first.
    /// Nothing is read from `source` until the receiver accepts.
    pub async fn send_offered<R>(
        &mut self,
        offer: TransferOffer,
        source: R,
    ) -> Result<TransferManifest>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.begin_transfer()?;
        let mut guard = TransferGuard::new(self);
        match guard.channel.send_stream_inner(offer, source).await {
            Ok(manifest) => {
                guard.complete();
                Ok(manifest)
            }
            Err(err) => {
                guard.channel.report_transfer_error(&err).await;
                Err(err)
            }
        }
    }

    /// Receive one transfer into `sink`, accepting whatever is offered. The
    /// sink is committed only after the whole-stream digest verifies; on any
    /// failure it is discarded.
    pub async fn receive_stream<K>(&mut self, sink: &mut K) -> Result<TransferManifest>
    where
        K: ChunkSink + ?Sized,
    {
        self.receive_with(sink, |_| true).await
    }

    /// Receive one transfer if `accept` approves the peer's offer. A refused
    /// offer is answered with ABORT and fails with
    /// [`ChannelError::OfferRejected`]; no DATA is read.
    pub async fn receive_with<K, F>(&mut self, sink: &mut K, accept: F) -> Result<TransferManifest>
    where
        K: ChunkSink + ?Sized,
        F: FnOnce(&TransferOffer) -> bool + Send,
    {
        self.begin_transfer()?;
        let mut guard = TransferGuard::new(self);
        match guard.channel.receive_stream_inner(sink, accept).await {
            Ok(manifest) => {
                guard.complete();
                Ok(manifest)
            }
            Err(err) => {
                if let Err(e) = sink.discard().await {
                    tracing::warn!(error = %e, "failed to discard partial transfer");
                }
                guard.channel.report_transfer_error(&err).await;
                Err(err)
            }
        }
    }

    /// Tell the peer to stop and fail the channel.
    pub async fn abort(&mut self, reason: AbortReason) -> Result<()> {
        if matches!(self.state, ChannelState::Failed | ChannelState::Closed) {
            return Err(ChannelError::ChannelUnusable(self.state));
        }
        self.fail();
        self.transport.send(Frame::Abort(reason).encode()).await?;
        Ok(())
    }

    /// Release keys and close the transport. A failed channel stays failed.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        if self.state != ChannelState::Failed {
            self.state = ChannelState::Closed;
        }
        self.session.release_keys();
        self.transport.close().await?;
        Ok(())
    }

    async fn send_stream_inner<R>(
        &mut self,
        offer: TransferOffer,
        source: R,
    ) -> Result<TransferManifest>
    where
        R: AsyncRead + Unpin + Send,
    {
        let session_id = self
            .session
            .session_id()
            .ok_or(ChannelError::ChannelUnusable(self.state))?;
        let chunk_size = self.config.chunk_size_bytes;
        let max_frame = self.config.max_frame_size();
        let verbose = self.config.verbose_logging;

        let sealed = seal_offer(self.session.send_key()?, &session_id, &offer)?;
        let start = Frame::Start(sealed).encode();
        if start.len() > HANDSHAKE_FRAME_LIMIT {
            return Err(ChannelError::InvalidConfig(format!(
                "transfer offer encodes to {} bytes, limit is {HANDSHAKE_FRAME_LIMIT}",
                start.len()
            )));
        }
        self.transport.send(start).await?;
        match receive_frame(&mut self.transport, max_frame).await? {
            Some(Frame::Accept) => {}
            Some(Frame::Abort(reason)) => return Err(ChannelError::PeerAborted(reason)),
            Some(other) => return Err(ChannelError::UnexpectedFrame(other.frame_type())),
            None => return Err(ChannelError::ConnectionClosed),
        }
        if verbose {
            tracing::debug!(name = %offer.name, size = ?offer.size, "offer accepted");
        }
        let interval = self.config.progress_interval_chunks;
        self.progress = Some(TransferProgress::new("send", interval).expecting(offer.size));
        self.offer = Some(offer);

        let mut sealer = StreamSealer::new(self.session.send_key()?, session_id, chunk_size);
        let mut blocks = ChunkReader::new(source, chunk_size);
        loop {
            let (block, is_final) = tokio::select! {
                biased;
                incoming = self.transport.receive() => {
                    return Err(interrupted_send(incoming, max_frame));
                }
                block = blocks.next_block() => match block? {
                    Some(block) => block,
                    None => break,
                },
            };
            let chunk = sealer.seal_next(&block, is_final)?;
            let sequence = chunk.sequence_number;
            self.transport.send(Frame::Data(chunk).encode()).await?;
            if let Some(progress) = self.progress.as_mut() {
                progress.record_chunk(block.len());
            }
            if verbose {
                tracing::debug!(sequence, bytes = block.len(), is_final, "sent chunk");
            }
            if is_final {
                break;
            }
        }
        let manifest = sealer
            .manifest()
            .ok_or_else(|| ChannelError::Encryption("source ended without final chunk".into()))?;
        self.session.record_chunks(manifest.chunk_count);

        if self.config.await_receipt {
            self.await_receipt(&manifest).await?;
        }

        if let Some(progress) = &self.progress {
            progress.finish();
        }
        tracing::info!(
            peer = %self.peer.fingerprint().short(),
            bytes = manifest.total_size,
            chunks = manifest.chunk_count,
            digest = %manifest.digest_hex(),
            "transfer sent"
        );
        Ok(manifest)
    }

    async fn await_receipt(&mut self, manifest: &TransferManifest) -> Result<()> {
        match receive_frame(&mut self.transport, self.config.max_frame_size()).await? {
            Some(Frame::Ack(receipt)) => {
                let digest_matches: bool = receipt.digest[..].ct_eq(&manifest.digest[..]).into();
                if receipt.total_size != manifest.total_size || !digest_matches {
                    return Err(ChannelError::DigestMismatch);
                }
                Ok(())
            }
            Some(Frame::Abort(reason)) => Err(ChannelError::PeerAborted(reason)),
            Some(other) => Err(ChannelError::UnexpectedFrame(other.frame_type())),
            None => Err(ChannelError::ConnectionClosed),
        }
    }

    async fn receive_stream_inner<K, F>(
        &mut self,
        sink: &mut K,
        accept: F,
    ) -> Result<TransferManifest>
    where
        K: ChunkSink + ?Sized,
        F: FnOnce(&TransferOffer) -> bool + Send,
    {
        let session_id = self
            .session
            .session_id()
            .ok_or(ChannelError::ChannelUnusable(self.state))?;
        let chunk_size = self.config.chunk_size_bytes;
        let max_frame = self.config.max_frame_size();
        let verbose = self.config.verbose_logging;

        let sealed = match self.receive_transfer_frame(HANDSHAKE_FRAME_LIMIT, 0).await? {
            Frame::Start(sealed) => sealed,
            Frame::Abort(reason) => return Err(ChannelError::PeerAborted(reason)),
            other => return Err(ChannelError::UnexpectedFrame(other.frame_type())),
        };
        let offer = open_offer(self.session.receive_key()?, &session_id, &sealed)?;
        let accepted = accept(&offer);
        tracing::info!(
            peer = %self.peer.fingerprint().short(),
            name = %offer.name,
            size = ?offer.size,
            accepted,
            "transfer offered"
        );
        let declared = offer.size;
        self.offer = Some(offer);
        if !accepted {
            return Err(ChannelError::OfferRejected);
        }
        self.transport.send(Frame::Accept.encode()).await?;
        let interval = self.config.progress_interval_chunks;
        self.progress = Some(TransferProgress::new("receive", interval).expecting(declared));

        let mut opener = StreamOpener::new(self.session.receive_key()?, session_id, chunk_size);
        while !opener.is_finished() {
            let frame = self
                .receive_transfer_frame(max_frame, opener.chunks_opened())
                .await?;
            match frame {
                Frame::Data(chunk) => {
                    let plaintext = opener.open_next(&chunk)?;
                    let received = match self.progress.as_mut() {
                        Some(progress) => {
                            progress.record_chunk(plaintext.len());
                            progress.bytes()
                        }
                        None => 0,
                    };
                    if let Some(declared) = declared {
                        if received > declared {
                            return Err(ChannelError::DeclaredSizeMismatch {
                                declared,
                                actual: received,
                            });
                        }
                    }
                    sink.write_chunk(&plaintext).await?;
                    if verbose {
                        tracing::debug!(
                            sequence = chunk.sequence_number,
                            bytes = plaintext.len(),
                            is_final = chunk.is_final,
                            "received chunk"
                        );
                    }
                }
                Frame::Abort(reason) => return Err(ChannelError::PeerAborted(reason)),
                other => return Err(ChannelError::UnexpectedFrame(other.frame_type())),
            }
        }

        let manifest = opener.finish()?;
        if let Some(declared) = declared {
            if declared != manifest.total_size {
                return Err(ChannelError::DeclaredSizeMismatch {
                    declared,
                    actual: manifest.total_size,
                });
            }
        }
        sink.commit().await?;
        self.session.record_chunks(manifest.chunk_count);

        let receipt = Frame::Ack(Receipt {
            total_size: manifest.total_size,
            digest: manifest.digest,
        });
        // The payload is verified and committed; a lost ACK only affects the sender.
        if let Err(e) = self.transport.send(receipt.encode()).await {
            tracing::warn!(error = %e, "failed to send ACK");
        }

        if let Some(progress) = &self.progress {
            progress.finish();
        }
        tracing::info!(
            peer = %self.peer.fingerprint().short(),
            bytes = manifest.total_size,
            chunks = manifest.chunk_count,
            digest = %manifest.digest_hex(),
            "transfer received"
        );
        Ok(manifest)
    }

    /// Next frame of a transfer in progress. The peer going away, cleanly or
    /// mid-frame, is a truncation.
    async fn receive_transfer_frame(
        &mut self,
        max_frame: usize,
        chunks_received: u64,
    ) -> Result<Frame> {
        match self.transport.receive().await {
            Ok(Some(bytes)) => Ok(Frame::decode(&bytes, max_frame)?),
            Ok(None) => Err(ChannelError::TruncatedTransfer { chunks_received }),
            Err(e) if is_disconnect(&e) => {
                tracing::debug!(error = %e, chunks_received, "transport dropped mid-transfer");
                Err(ChannelError::TruncatedTransfer { chunks_received })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn report_transfer_error(&mut self, err: &ChannelError) {
        tracing::warn!(role = %self.role(), error = %err, "transfer failed");
        if !peer_already_gone(err) {
            send_abort(&mut self.transport, err.abort_reason()).await;
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.session.role())
            .field("state", &self.state)
            .field("peer", &self.peer.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Fails the channel and wipes its keys unless the transfer completed,
/// including when the transfer future is dropped mid-flight.
struct TransferGuard<'a, T> {
    channel: &'a mut Channel<T>,
    completed: bool,
}

impl<'a, T> TransferGuard<'a, T> {
    fn new(channel: &'a mut Channel<T>) -> Self {
        Self {
            channel,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
        self.channel.state = ChannelState::Complete;
        self.channel.session.release_keys();
    }
}

impl<T> Drop for TransferGuard<'_, T> {
    fn drop(&mut self) {
        if !self.completed {
            if self.channel.state == ChannelState::Transferring {
                tracing::debug!(role = %self.channel.role(), "transfer interrupted");
            }
            self.channel.fail();
        }
    }
}
