//! Chunked AES-256-GCM streaming with whole-stream integrity.
//!
//! Each chunk's nonce is `session_id[..4] || sequence_number (LE)`, derived
//! and never transmitted. The AAD binds the protocol id, session id,
//! sequence number and final flag, so reordering or re-marking a chunk
//! breaks authentication.
//!
//! The final chunk's plaintext ends with a trailer carrying the total
//! payload size and the SHA-256 of the payload. The opener recomputes both
//! and fails the transfer on mismatch even when every chunk authenticated.
//!
//! The START offer is sealed under the same key with the reserved sequence
//! number [`OFFER_SEQUENCE`] and its own AAD label.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use crypto::hashes::RollingHash;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::error::{ChannelError, OrderingViolation, Result};
use crate::sink::ChunkSink;
use crate::types::{
    Frame, FrameError, SealedOffer, TransferOffer, DATA_FRAME_OVERHEAD, DIGEST_LEN, PROTOCOL_ID,
    SESSION_ID_LEN, TAG_LEN,
};

pub const NONCE_LEN: usize = 12;

/// Trailer appended to the final chunk: total size (u64 LE) || SHA-256.
pub const TRAILER_LEN: usize = 8 + DIGEST_LEN;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const MIN_CHUNK_SIZE: usize = 1;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Never assigned to a chunk: the sealer runs out of sequence numbers first.
pub const OFFER_SEQUENCE: u64 = u64::MAX;

const OFFER_LABEL: &[u8] = b"start";

/// One sealed chunk as carried in a DATA frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub sequence_number: u64,
    pub is_final: bool,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Summary of a verified transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferManifest {
    pub total_size: u64,
    pub digest: [u8; DIGEST_LEN],
    pub chunk_size: usize,
    pub chunk_count: u64,
}

impl TransferManifest {
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

pub fn chunk_nonce(session_id: &[u8; SESSION_ID_LEN], sequence_number: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&session_id[..4]);
    nonce[4..].copy_from_slice(&sequence_number.to_le_bytes());
    nonce
}

fn chunk_aad(session_id: &[u8; SESSION_ID_LEN], sequence_number: u64, is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PROTOCOL_ID.len() + SESSION_ID_LEN + 9);
    aad.extend_from_slice(PROTOCOL_ID);
    aad.extend_from_slice(session_id);
    aad.extend_from_slice(&sequence_number.to_le_bytes());
    aad.push(u8::from(is_final));
    aad
}

fn offer_aad(session_id: &[u8; SESSION_ID_LEN]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PROTOCOL_ID.len() + OFFER_LABEL.len() + SESSION_ID_LEN);
    aad.extend_from_slice(PROTOCOL_ID);
    aad.extend_from_slice(OFFER_LABEL);
    aad.extend_from_slice(session_id);
    aad
}

fn encrypt_detached(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> std::result::Result<(Vec<u8>, [u8; TAG_LEN]), aead::Error> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut sealed = cipher.encrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: plaintext,
            aad,
        },
    )?;
    let tag_start = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);
    Ok((sealed, tag))
}

fn decrypt_detached(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> std::result::Result<Vec<u8>, aead::Error> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);
    cipher.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: &sealed,
            aad,
        },
    )
}

pub fn seal_chunk(
    key: &[u8; 32],
    session_id: &[u8; SESSION_ID_LEN],
    sequence_number: u64,
    plaintext: &[u8],
    is_final: bool,
) -> Result<Chunk> {
    let nonce = chunk_nonce(session_id, sequence_number);
    let aad = chunk_aad(session_id, sequence_number, is_final);
    let (ciphertext, tag) = encrypt_detached(key, &nonce, &aad, plaintext)
        .map_err(|e| ChannelError::Encryption(format!("chunk {sequence_number}: {e}")))?;
    Ok(Chunk {
        sequence_number,
        is_final,
        ciphertext,
        tag,
    })
}

/// Open `chunk`, refusing to decrypt unless it carries the expected sequence number.
pub fn open_chunk(
    key: &[u8; 32],
    session_id: &[u8; SESSION_ID_LEN],
    expected_sequence_number: u64,
    chunk: &Chunk,
) -> Result<Vec<u8>> {
    if chunk.sequence_number != expected_sequence_number {
        return Err(ChannelError::Ordering(OrderingViolation::OutOfSequence {
            expected: expected_sequence_number,
            got: chunk.sequence_number,
        }));
    }

    let nonce = chunk_nonce(session_id, chunk.sequence_number);
    let aad = chunk_aad(session_id, chunk.sequence_number, chunk.is_final);
    decrypt_detached(key, &nonce, &aad, &chunk.ciphertext, &chunk.tag).map_err(|_| {
        ChannelError::Integrity {
            sequence: chunk.sequence_number,
        }
    })
}

pub fn seal_offer(
    key: &[u8; 32],
    session_id: &[u8; SESSION_ID_LEN],
    offer: &TransferOffer,
) -> Result<SealedOffer> {
    let nonce = chunk_nonce(session_id, OFFER_SEQUENCE);
    let plaintext = Zeroizing::new(offer.encode());
    let (ciphertext, tag) = encrypt_detached(key, &nonce, &offer_aad(session_id), &plaintext)
        .map_err(|e| ChannelError::Encryption(format!("offer: {e}")))?;
    Ok(SealedOffer { ciphertext, tag })
}

pub fn open_offer(
    key: &[u8; 32],
    session_id: &[u8; SESSION_ID_LEN],
    sealed: &SealedOffer,
) -> Result<TransferOffer> {
    let nonce = chunk_nonce(session_id, OFFER_SEQUENCE);
    let plaintext = decrypt_detached(
        key,
        &nonce,
        &offer_aad(session_id),
        &sealed.ciphertext,
        &sealed.tag,
    )
    .map(Zeroizing::new)
    .map_err(|_| ChannelError::OfferIntegrity)?;
    Ok(TransferOffer::decode(&plaintext)?)
}

/// Wire size of a payload of `total_size` bytes sent in `chunk_size` pieces.
pub fn estimate_sealed_size(total_size: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size.max(MIN_CHUNK_SIZE) as u64;
    let chunks = total_size.div_ceil(chunk_size).max(1);
    total_size + TRAILER_LEN as u64 + chunks * DATA_FRAME_OVERHEAD as u64
}

/// Sending half of one direction's stream.
pub struct StreamSealer {
    key: Zeroizing<[u8; 32]>,
    session_id: [u8; SESSION_ID_LEN],
    chunk_size: usize,
    next_sequence: u64,
    hash: RollingHash,
    manifest: Option<TransferManifest>,
}

impl StreamSealer {
    pub fn new(key: &[u8; 32], session_id: [u8; SESSION_ID_LEN], chunk_size: usize) -> Self {
        Self {
            key: Zeroizing::new(*key),
            session_id,
            chunk_size,
            next_sequence: 0,
            hash: RollingHash::new(),
            manifest: None,
        }
    }

    /// Seal the next piece of payload. The final piece gets the trailer.
    pub fn seal_next(&mut self, payload: &[u8], is_final: bool) -> Result<Chunk> {
        if self.manifest.is_some() {
            return Err(ChannelError::Ordering(OrderingViolation::AfterFinal {
                sequence: self.next_sequence,
            }));
        }
        debug_assert!(payload.len() <= self.chunk_size);

        let sequence_number = self.next_sequence;
        self.next_sequence = sequence_number
            .checked_add(1)
            .ok_or(ChannelError::SequenceExhausted)?;
        self.hash.update(payload);

        if !is_final {
            return seal_chunk(&self.key, &self.session_id, sequence_number, payload, false);
        }

        let total_size = self.hash.total_bytes();
        let digest = std::mem::take(&mut self.hash).finalize();
        let mut plaintext = Zeroizing::new(Vec::with_capacity(payload.len() + TRAILER_LEN));
        plaintext.extend_from_slice(payload);
        plaintext.extend_from_slice(&total_size.to_le_bytes());
        plaintext.extend_from_slice(&digest);

        let chunk = seal_chunk(&self.key, &self.session_id, sequence_number, &plaintext, true)?;
        self.manifest = Some(TransferManifest {
            total_size,
            digest,
            chunk_size: self.chunk_size,
            chunk_count: self.next_sequence,
        });
        Ok(chunk)
    }

    /// Available once the final chunk has been sealed.
    pub fn manifest(&self) -> Option<TransferManifest> {
        self.manifest
    }
}

/// Receiving half of one direction's stream.
pub struct StreamOpener {
    key: Zeroizing<[u8; 32]>,
    session_id: [u8; SESSION_ID_LEN],
    chunk_size: usize,
    expected_sequence: u64,
    hash: RollingHash,
    manifest: Option<TransferManifest>,
}

impl StreamOpener {
    pub fn new(key: &[u8; 32], session_id: [u8; SESSION_ID_LEN], chunk_size: usize) -> Self {
        Self {
            key: Zeroizing::new(*key),
            session_id,
            chunk_size,
            expected_sequence: 0,
            hash: RollingHash::new(),
            manifest: None,
        }
    }

    /// Open the next chunk and return its payload (trailer stripped).
    ///
    /// A final chunk is only returned once size and digest match.
    pub fn open_next(&mut self, chunk: &Chunk) -> Result<Vec<u8>> {
        if self.manifest.is_some() {
            return Err(ChannelError::Ordering(OrderingViolation::AfterFinal {
                sequence: chunk.sequence_number,
            }));
        }

        let mut plaintext = open_chunk(&self.key, &self.session_id, self.expected_sequence, chunk)?;
        self.expected_sequence = self
            .expected_sequence
            .checked_add(1)
            .ok_or(ChannelError::SequenceExhausted)?;

        if !chunk.is_final {
            self.hash.update(&plaintext);
            return Ok(plaintext);
        }

        if plaintext.len() < TRAILER_LEN {
            return Err(ChannelError::DigestMismatch);
        }
        let trailer = plaintext.split_off(plaintext.len() - TRAILER_LEN);
        self.hash.update(&plaintext);

        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&trailer[..8]);
        let claimed_size = u64::from_le_bytes(size_bytes);

        let total_size = self.hash.total_bytes();
        let digest = std::mem::take(&mut self.hash).finalize();
        let digest_matches: bool = digest[..].ct_eq(&trailer[8..]).into();
        if claimed_size != total_size || !digest_matches {
            return Err(ChannelError::DigestMismatch);
        }

        self.manifest = Some(TransferManifest {
            total_size,
            digest,
            chunk_size: self.chunk_size,
            chunk_count: self.expected_sequence,
        });
        Ok(plaintext)
    }

    pub fn is_finished(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn chunks_opened(&self) -> u64 {
        self.expected_sequence
    }

    /// The verified manifest, or `TruncatedTransfer` if no final chunk arrived.
    pub fn finish(&self) -> Result<TransferManifest> {
        self.manifest.ok_or(ChannelError::TruncatedTransfer {
            chunks_received: self.expected_sequence,
        })
    }
}

/// Reads a source in fixed-size blocks with one block of look-ahead, so the
/// last block can be flagged final. An empty source yields one empty final block.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    pending: Option<Vec<u8>>,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
            pending: None,
            done: false,
        }
    }

    pub async fn next_block(&mut self) -> std::io::Result<Option<(Vec<u8>, bool)>> {
        if self.done {
            return Ok(None);
        }
        let current = match self.pending.take() {
            Some(block) => block,
            None => self.read_block().await?,
        };
        if current.len() < self.chunk_size {
            self.done = true;
            return Ok(Some((current, true)));
        }
        let next = self.read_block().await?;
        if next.is_empty() {
            self.done = true;
            return Ok(Some((current, true)));
        }
        self.pending = Some(next);
        Ok(Some((current, false)))
    }

    async fn read_block(&mut self) -> std::io::Result<Vec<u8>> {
        let mut block = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < block.len() {
            let n = self.reader.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        block.truncate(filled);
        Ok(block)
    }
}

const CONTAINER_MAGIC: &[u8; 4] = b"PQXF";
const CONTAINER_VERSION: u8 = 1;
const CONTAINER_HEADER_LEN: usize = 4 + 1 + SESSION_ID_LEN + 4;

/// Seal `reader` into a self-delimiting container on `writer`.
///
/// Layout: `magic || version || session_id || chunk_size (u32 LE)`, then
/// each DATA frame as `u32 LE length || frame`.
pub async fn seal_to_writer<R, W>(
    key: &[u8; 32],
    session_id: [u8; SESSION_ID_LEN],
    chunk_size: usize,
    reader: R,
    writer: &mut W,
) -> Result<TransferManifest>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(ChannelError::InvalidConfig(format!(
            "chunk size {chunk_size} out of range"
        )));
    }

    let mut header = Vec::with_capacity(CONTAINER_HEADER_LEN);
    header.extend_from_slice(CONTAINER_MAGIC);
    header.push(CONTAINER_VERSION);
    header.extend_from_slice(&session_id);
    header.extend_from_slice(&(chunk_size as u32).to_le_bytes());
    writer.write_all(&header).await?;

    let mut sealer = StreamSealer::new(key, session_id, chunk_size);
    let mut blocks = ChunkReader::new(reader, chunk_size);
    while let Some((block, is_final)) = blocks.next_block().await? {
        let frame = Frame::Data(sealer.seal_next(&block, is_final)?).encode();
        writer.write_u32_le(frame.len() as u32).await?;
        writer.write_all(&frame).await?;
    }
    writer.flush().await?;

    sealer
        .manifest()
        .ok_or(ChannelError::Encryption("stream ended without final chunk".into()))
}

/// Open a container written by [`seal_to_writer`] into `sink`.
///
/// The sink is committed only once the final chunk's digest verifies and
/// discarded on any failure, including a container cut short.
pub async fn open_from_reader<R, K>(
    key: &[u8; 32],
    reader: &mut R,
    sink: &mut K,
) -> Result<TransferManifest>
where
    R: AsyncRead + Unpin,
    K: ChunkSink + ?Sized,
{
    match open_container(key, reader, sink).await {
        Ok(manifest) => {
            sink.commit().await?;
            Ok(manifest)
        }
        Err(err) => {
            if let Err(e) = sink.discard().await {
                tracing::warn!(error = %e, "failed to discard partial container output");
            }
            Err(err)
        }
    }
}

async fn open_container<R, K>(
    key: &[u8; 32],
    reader: &mut R,
    sink: &mut K,
) -> Result<TransferManifest>
where
    R: AsyncRead + Unpin,
    K: ChunkSink + ?Sized,
{
    let mut header = [0u8; CONTAINER_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| truncated_on_eof(e, 0))?;
    if &header[..4] != CONTAINER_MAGIC {
        return Err(FrameError::InvalidField("container magic").into());
    }
    if header[4] != CONTAINER_VERSION {
        return Err(FrameError::InvalidField("container version").into());
    }
    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&header[5..5 + SESSION_ID_LEN]);
    let mut size_bytes = [0u8; 4];
    size_bytes.copy_from_slice(&header[5 + SESSION_ID_LEN..]);
    let chunk_size = u32::from_le_bytes(size_bytes) as usize;
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(FrameError::InvalidField("container chunk size").into());
    }
    let max_frame = chunk_size + TRAILER_LEN + DATA_FRAME_OVERHEAD;

    let mut opener = StreamOpener::new(key, session_id, chunk_size);
    while !opener.is_finished() {
        let len = match reader.read_u32_le().await {
            Ok(len) => len as usize,
            Err(e) => return Err(truncated_on_eof(e, opener.chunks_opened())),
        };
        if len > max_frame {
            return Err(FrameError::TooLarge { len, max: max_frame }.into());
        }
        let mut frame = vec![0u8; len];
        reader
            .read_exact(&mut frame)
            .await
            .map_err(|e| truncated_on_eof(e, opener.chunks_opened()))?;
        let chunk = match Frame::decode(&frame, max_frame)? {
            Frame::Data(chunk) => chunk,
            other => return Err(ChannelError::UnexpectedFrame(other.frame_type())),
        };
        let plaintext = opener.open_next(&chunk)?;
        sink.write_chunk(&plaintext).await?;
    }
    opener.finish()
}

fn truncated_on_eof(err: std::io::Error, chunks_received: u64) -> ChannelError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ChannelError::TruncatedTransfer { chunks_received }
    } else {
        err.into()
    }
}
