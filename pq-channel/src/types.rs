//! Wire frames and their binary encoding.
//!
//! Every frame starts with a one-byte type. Integers are little-endian.
//! Variable-length byte fields are a `u32` LE length followed by the bytes;
//! fixed-size fields (tags, digests, confirmations) are written raw.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::stream::Chunk;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Protocol identifier, bound into the transcript and every chunk's AAD
pub const PROTOCOL_ID: &[u8] = b"pq-transfer/1";

pub const TAG_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;
pub const CONFIRMATION_LEN: usize = 32;
pub const SESSION_ID_LEN: usize = 16;

/// Upper bound for any handshake frame, independent of chunk size.
pub const HANDSHAKE_FRAME_LIMIT: usize = 4096;

/// Bytes a DATA frame adds around its ciphertext.
pub const DATA_FRAME_OVERHEAD: usize = 1 + 8 + 1 + 4 + TAG_LEN;

const TYPE_HELLO: u8 = 0x01;
const TYPE_RESPONSE: u8 = 0x02;
const TYPE_IDENTITY: u8 = 0x03;
const TYPE_DATA: u8 = 0x04;
const TYPE_ACK: u8 = 0x05;
const TYPE_ABORT: u8 = 0x06;
const TYPE_START: u8 = 0x07;
const TYPE_ACCEPT: u8 = 0x08;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub(crate) fn label(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"initiator",
            Role::Responder => b"responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Initiator's opening frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloFrame {
    pub version: u8,
    /// X25519 ephemeral public key (32 bytes)
    pub classical_public: Vec<u8>,
    /// ML-KEM-768 encapsulation key (1184 bytes)
    pub kem_public: Vec<u8>,
}

/// Responder's reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    pub version: u8,
    pub classical_public: Vec<u8>,
    /// ML-KEM ciphertext to the initiator's key (1088 bytes)
    pub kem_ciphertext: Vec<u8>,
}

/// Identity proof sent by both sides once keys are derived
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityFrame {
    pub identity_public: Vec<u8>,
    pub signature: Vec<u8>,
    pub key_confirmation: [u8; CONFIRMATION_LEN],
}

/// What the sender is about to stream, shown to the receiver before any
/// DATA so it can accept or refuse the transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferOffer {
    pub name: String,
    /// Declared payload size; checked against the verified total
    pub size: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

impl TransferOffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Plaintext layout: `name || size_flag (u8) [|| size (u64 LE)] ||
    /// count (u32 LE) || (key || value)*`, strings as length-prefixed fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, self.name.as_bytes());
        match self.size {
            Some(size) => {
                buf.put_u8(1);
                buf.put_u64_le(size);
            }
            None => buf.put_u8(0),
        }
        buf.put_u32_le(self.metadata.len() as u32);
        for (key, value) in &self.metadata {
            put_field(&mut buf, key.as_bytes());
            put_field(&mut buf, value.as_bytes());
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader { buf: bytes };
        let name = reader.string("offer name")?;
        let size = match reader.u8()? {
            0 => None,
            1 => Some(reader.u64()?),
            _ => return Err(FrameError::InvalidField("offer size flag")),
        };
        let count = reader.u32()?;
        let mut metadata = BTreeMap::new();
        for _ in 0..count {
            let key = reader.string("offer metadata key")?;
            let value = reader.string("offer metadata value")?;
            metadata.insert(key, value);
        }
        reader.finish()?;
        Ok(Self {
            name,
            size,
            metadata,
        })
    }
}

/// A [`TransferOffer`] sealed under the sender's stream key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedOffer {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Receiver's acknowledgement of a verified transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub total_size: u64,
    pub digest: [u8; DIGEST_LEN],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    HandshakeFailure,
    IdentityMismatch,
    IntegrityFailure,
    OrderingFailure,
    DigestMismatch,
    LocalCancel,
    ProtocolViolation,
    Rejected,
    Unknown(u32),
}

impl AbortReason {
    pub fn code(self) -> u32 {
        match self {
            AbortReason::HandshakeFailure => 1,
            AbortReason::IdentityMismatch => 2,
            AbortReason::IntegrityFailure => 3,
            AbortReason::OrderingFailure => 4,
            AbortReason::DigestMismatch => 5,
            AbortReason::LocalCancel => 6,
            AbortReason::ProtocolViolation => 7,
            AbortReason::Rejected => 8,
            AbortReason::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => AbortReason::HandshakeFailure,
            2 => AbortReason::IdentityMismatch,
            3 => AbortReason::IntegrityFailure,
            4 => AbortReason::OrderingFailure,
            5 => AbortReason::DigestMismatch,
            6 => AbortReason::LocalCancel,
            7 => AbortReason::ProtocolViolation,
            8 => AbortReason::Rejected,
            other => AbortReason::Unknown(other),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::HandshakeFailure => "handshake failure",
            AbortReason::IdentityMismatch => "identity mismatch",
            AbortReason::IntegrityFailure => "integrity failure",
            AbortReason::OrderingFailure => "ordering failure",
            AbortReason::DigestMismatch => "digest mismatch",
            AbortReason::LocalCancel => "cancelled",
            AbortReason::ProtocolViolation => "protocol violation",
            AbortReason::Rejected => "transfer rejected",
            AbortReason::Unknown(code) => return write!(f, "unknown reason {code}"),
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Hello(HelloFrame),
    Response(ResponseFrame),
    Identity(IdentityFrame),
    Data(Chunk),
    Ack(Receipt),
    Abort(AbortReason),
    Start(SealedOffer),
    Accept,
}

impl Frame {
    /// Frame type name for logs and errors
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "HELLO",
            Frame::Response(_) => "RESPONSE",
            Frame::Identity(_) => "IDENTITY",
            Frame::Data(_) => "DATA",
            Frame::Ack(_) => "ACK",
            Frame::Abort(_) => "ABORT",
            Frame::Start(_) => "START",
            Frame::Accept => "ACCEPT",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Hello(hello) => {
                buf.put_u8(TYPE_HELLO);
                buf.put_u8(hello.version);
                put_field(&mut buf, &hello.classical_public);
                put_field(&mut buf, &hello.kem_public);
            }
            Frame::Response(response) => {
                buf.put_u8(TYPE_RESPONSE);
                buf.put_u8(response.version);
                put_field(&mut buf, &response.classical_public);
                put_field(&mut buf, &response.kem_ciphertext);
            }
            Frame::Identity(identity) => {
                buf.put_u8(TYPE_IDENTITY);
                put_field(&mut buf, &identity.identity_public);
                put_field(&mut buf, &identity.signature);
                buf.put_slice(&identity.key_confirmation);
            }
            Frame::Data(chunk) => {
                buf.reserve(DATA_FRAME_OVERHEAD + chunk.ciphertext.len());
                buf.put_u8(TYPE_DATA);
                buf.put_u64_le(chunk.sequence_number);
                buf.put_u8(u8::from(chunk.is_final));
                put_field(&mut buf, &chunk.ciphertext);
                buf.put_slice(&chunk.tag);
            }
            Frame::Ack(receipt) => {
                buf.put_u8(TYPE_ACK);
                buf.put_u64_le(receipt.total_size);
                buf.put_slice(&receipt.digest);
            }
            Frame::Abort(reason) => {
                buf.put_u8(TYPE_ABORT);
                buf.put_u32_le(reason.code());
            }
            Frame::Start(offer) => {
                buf.put_u8(TYPE_START);
                put_field(&mut buf, &offer.ciphertext);
                buf.put_slice(&offer.tag);
            }
            Frame::Accept => buf.put_u8(TYPE_ACCEPT),
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8], max_frame_size: usize) -> Result<Frame, FrameError> {
        if frame.len() > max_frame_size {
            return Err(FrameError::TooLarge {
                len: frame.len(),
                max: max_frame_size,
            });
        }
        let mut reader = Reader { buf: frame };
        let frame_type = reader.u8().map_err(|_| FrameError::Empty)?;
        let decoded = match frame_type {
            TYPE_HELLO => Frame::Hello(HelloFrame {
                version: reader.u8()?,
                classical_public: reader.field()?,
                kem_public: reader.field()?,
            }),
            TYPE_RESPONSE => Frame::Response(ResponseFrame {
                version: reader.u8()?,
                classical_public: reader.field()?,
                kem_ciphertext: reader.field()?,
            }),
            TYPE_IDENTITY => Frame::Identity(IdentityFrame {
                identity_public: reader.field()?,
                signature: reader.field()?,
                key_confirmation: reader.array()?,
            }),
            TYPE_DATA => {
                let sequence_number = reader.u64()?;
                let is_final = match reader.u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(FrameError::InvalidField("is_final")),
                };
                Frame::Data(Chunk {
                    sequence_number,
                    is_final,
                    ciphertext: reader.field()?,
                    tag: reader.array()?,
                })
            }
            TYPE_ACK => Frame::Ack(Receipt {
                total_size: reader.u64()?,
                digest: reader.array()?,
            }),
            TYPE_ABORT => Frame::Abort(AbortReason::from_code(reader.u32()?)),
            TYPE_START => Frame::Start(SealedOffer {
                ciphertext: reader.field()?,
                tag: reader.array()?,
            }),
            TYPE_ACCEPT => Frame::Accept,
            other => return Err(FrameError::UnknownType(other)),
        };
        reader.finish()?;
        Ok(decoded)
    }
}

fn put_field(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, n: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < n {
            return Err(FrameError::Truncated);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn field(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head.to_vec())
    }

    fn string(&mut self, what: &'static str) -> Result<String, FrameError> {
        String::from_utf8(self.field()?).map_err(|_| FrameError::InvalidField(what))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn finish(self) -> Result<(), FrameError> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(FrameError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIMIT: usize = 1 << 20;

    fn sample_chunk() -> Chunk {
        Chunk {
            sequence_number: 0x0102_0304_0506_0708,
            is_final: true,
            ciphertext: vec![0xaa; 5],
            tag: [0x55; TAG_LEN],
        }
    }

    #[test]
    fn data_frame_layout() {
        let bytes = Frame::Data(sample_chunk()).encode();
        assert_eq!(bytes[0], 0x04);
        assert_eq!(&bytes[1..9], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(bytes[9], 1);
        assert_eq!(&bytes[10..14], &[5, 0, 0, 0]);
        assert_eq!(&bytes[14..19], &[0xaa; 5]);
        assert_eq!(&bytes[19..], &[0x55; TAG_LEN]);
        assert_eq!(bytes.len(), DATA_FRAME_OVERHEAD + 5);
    }

    #[test]
    fn abort_frame_layout() {
        let bytes = Frame::Abort(AbortReason::DigestMismatch).encode();
        assert_eq!(&bytes[..], &[0x06, 5, 0, 0, 0]);
        assert_eq!(
            Frame::decode(&bytes, LIMIT).unwrap(),
            Frame::Abort(AbortReason::DigestMismatch)
        );
    }

    #[test]
    fn unknown_abort_code_preserved() {
        let bytes = [0x06, 0x2a, 0, 0, 0];
        let frame = Frame::decode(&bytes, LIMIT).unwrap();
        assert_eq!(frame, Frame::Abort(AbortReason::Unknown(42)));
        assert_eq!(&frame.encode()[..], &bytes);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert_eq!(
            Frame::decode(&[0x7f], LIMIT),
            Err(FrameError::UnknownType(0x7f))
        );
        assert_eq!(Frame::decode(&[], LIMIT), Err(FrameError::Empty));
    }

    #[test]
    fn decode_rejects_truncated_and_trailing() {
        let bytes = Frame::Data(sample_chunk()).encode();
        assert_eq!(
            Frame::decode(&bytes[..bytes.len() - 1], LIMIT),
            Err(FrameError::Truncated)
        );

        let mut extended = bytes.to_vec();
        extended.push(0);
        assert_eq!(
            Frame::decode(&extended, LIMIT),
            Err(FrameError::TrailingBytes(1))
        );
    }

    #[test]
    fn decode_rejects_oversize_frame() {
        let bytes = Frame::Data(sample_chunk()).encode();
        assert_eq!(
            Frame::decode(&bytes, 10),
            Err(FrameError::TooLarge {
                len: bytes.len(),
                max: 10
            })
        );
    }

    #[test]
    fn decode_rejects_lying_length_prefix() {
        let mut bytes = vec![TYPE_HELLO, PROTOCOL_VERSION];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert_eq!(Frame::decode(&bytes, LIMIT), Err(FrameError::Truncated));
    }

    #[test]
    fn decode_rejects_bad_final_flag() {
        let mut bytes = Frame::Data(sample_chunk()).encode().to_vec();
        bytes[9] = 2;
        assert_eq!(
            Frame::decode(&bytes, LIMIT),
            Err(FrameError::InvalidField("is_final"))
        );
    }

    #[test]
    fn handshake_frames_decode() {
        let hello = Frame::Hello(HelloFrame {
            version: PROTOCOL_VERSION,
            classical_public: vec![1; 32],
            kem_public: vec![2; 1184],
        });
        assert_eq!(Frame::decode(&hello.encode(), LIMIT).unwrap(), hello);

        let identity = Frame::Identity(IdentityFrame {
            identity_public: vec![3; 32],
            signature: vec![4; 64],
            key_confirmation: [5; CONFIRMATION_LEN],
        });
        assert_eq!(Frame::decode(&identity.encode(), LIMIT).unwrap(), identity);
    }

    #[test]
    fn offer_layout_and_decode() {
        let offer = TransferOffer::new("report.pdf")
            .with_size(0x0102)
            .with_metadata("type", "pdf");
        let bytes = offer.encode();
        assert_eq!(&bytes[..4], &[10, 0, 0, 0]);
        assert_eq!(&bytes[4..14], b"report.pdf");
        assert_eq!(bytes[14], 1);
        assert_eq!(&bytes[15..23], &[2, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[23..27], &[1, 0, 0, 0]);
        assert_eq!(TransferOffer::decode(&bytes).unwrap(), offer);

        let bare = TransferOffer::default().encode();
        assert_eq!(bare, vec![0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn offer_rejects_bad_utf8_and_flag() {
        let mut bytes = TransferOffer::new("ab").encode();
        bytes[4] = 0xff;
        assert_eq!(
            TransferOffer::decode(&bytes),
            Err(FrameError::InvalidField("offer name"))
        );

        let mut bytes = TransferOffer::default().encode();
        bytes[4] = 7;
        assert_eq!(
            TransferOffer::decode(&bytes),
            Err(FrameError::InvalidField("offer size flag"))
        );
    }

    #[test]
    fn start_and_accept_frames_decode() {
        let start = Frame::Start(SealedOffer {
            ciphertext: vec![7; 20],
            tag: [8; TAG_LEN],
        });
        assert_eq!(start.encode()[0], 0x07);
        assert_eq!(Frame::decode(&start.encode(), LIMIT).unwrap(), start);
        assert_eq!(&Frame::Accept.encode()[..], &[0x08]);
        assert_eq!(Frame::decode(&[0x08], LIMIT).unwrap(), Frame::Accept);
        assert_eq!(AbortReason::from_code(8), AbortReason::Rejected);
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Frame::decode(&bytes, LIMIT);
        }

        #[test]
        fn data_frames_decode_to_themselves(
            sequence_number in any::<u64>(),
            is_final in any::<bool>(),
            ciphertext in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = Frame::Data(Chunk { sequence_number, is_final, ciphertext, tag: [9; TAG_LEN] });
            prop_assert_eq!(Frame::decode(&frame.encode(), LIMIT).unwrap(), frame);
        }
    }
}
