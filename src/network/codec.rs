//! On-wire datagram format.
//! Layout: [IsAck:1][SeqNr:4 LE][ProcessId:1][MetaLen:2 LE][Meta][0..8 x [Len:2 LE][Payload]]

use arrayvec::ArrayVec;
use thiserror::Error;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::core::id::{ProcessId, SeqNr};

/// Hard upper bound on an encoded datagram. Each application message is one
/// datagram; callers must split anything larger. Sized so a realistic lattice
/// proposal (a few hundred 4-byte values) still fits a single UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// At most this many payload chunks are packed into one datagram.
pub const MAX_CHUNKS: usize = 8;

/// Fixed prefix of every datagram.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Header {
    is_ack: u8,
    seq_nr: U32,
    process_id: u8,
}

const _: () = {
    assert!(core::mem::size_of::<Header>() == 6);
};

impl Header {
    pub const SIZE: usize = 6;
}

/// Length of an encoded ACK: header plus an empty metadata field.
pub const ACK_SIZE: usize = Header::SIZE + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("encoded datagram would be {0} bytes, limit is {MAX_DATAGRAM_SIZE}")]
    DatagramTooLarge(usize),
    #[error("{0} payload chunks, limit is {MAX_CHUNKS}")]
    TooManyChunks(usize),
    #[error("datagram truncated")]
    Truncated,
}

/// A decoded datagram. `metadata` and `payloads` borrow from the receive
/// buffer and are valid only while it is; retention requires a copy.
#[derive(Debug)]
pub struct Datagram<'a> {
    pub is_ack: bool,
    pub seq_nr: SeqNr,
    pub sender: ProcessId,
    pub metadata: &'a [u8],
    pub payloads: ArrayVec<&'a [u8], MAX_CHUNKS>,
}

/// Encodes a data datagram (`is_ack = 0`). Fails rather than truncate when
/// the total exceeds [`MAX_DATAGRAM_SIZE`].
pub fn encode(
    seq_nr: SeqNr,
    sender: ProcessId,
    metadata: &[u8],
    payloads: &[&[u8]],
) -> Result<Vec<u8>, WireError> {
    if payloads.len() > MAX_CHUNKS {
        return Err(WireError::TooManyChunks(payloads.len()));
    }

    let total = Header::SIZE
        + 2
        + metadata.len()
        + payloads.iter().map(|p| 2 + p.len()).sum::<usize>();
    if total > MAX_DATAGRAM_SIZE {
        return Err(WireError::DatagramTooLarge(total));
    }

    let header = Header {
        is_ack: 0,
        seq_nr: U32::new(seq_nr),
        process_id: sender,
    };

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(U16::new(metadata.len() as u16).as_bytes());
    buf.extend_from_slice(metadata);
    for payload in payloads {
        buf.extend_from_slice(U16::new(payload.len() as u16).as_bytes());
        buf.extend_from_slice(payload);
    }
    debug_assert_eq!(buf.len(), total);
    Ok(buf)
}

/// Encodes an ACK for `seq_nr`, stamped with the acknowledger's id.
pub fn encode_ack(seq_nr: SeqNr, sender: ProcessId) -> [u8; ACK_SIZE] {
    let header = Header {
        is_ack: 1,
        seq_nr: U32::new(seq_nr),
        process_id: sender,
    };
    let mut buf = [0u8; ACK_SIZE];
    buf[..Header::SIZE].copy_from_slice(header.as_bytes());
    buf
}

/// Decodes one received datagram. For ACKs everything past the header is
/// ignored. Any field running past the end of `buf` is a hard error; the
/// caller drops the datagram.
pub fn decode(buf: &[u8]) -> Result<Datagram<'_>, WireError> {
    let (header, mut rest) =
        Header::read_from_prefix(buf).map_err(|_| WireError::Truncated)?;

    let seq_nr = header.seq_nr.get();
    let sender = header.process_id;

    if header.is_ack != 0 {
        return Ok(Datagram {
            is_ack: true,
            seq_nr,
            sender,
            metadata: &[],
            payloads: ArrayVec::new(),
        });
    }

    let metadata;
    (metadata, rest) = split_chunk(rest)?;

    let mut payloads = ArrayVec::new();
    while !rest.is_empty() {
        let chunk;
        (chunk, rest) = split_chunk(rest)?;
        payloads
            .try_push(chunk)
            .map_err(|_| WireError::TooManyChunks(MAX_CHUNKS + 1))?;
    }

    Ok(Datagram {
        is_ack: false,
        seq_nr,
        sender,
        metadata,
        payloads,
    })
}

/// Splits a `[len : 2 LE][bytes]` chunk off the front of `buf`.
#[inline]
fn split_chunk(buf: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    let (len, rest) = U16::read_from_prefix(buf).map_err(|_| WireError::Truncated)?;
    let len = len.get() as usize;
    if rest.len() < len {
        return Err(WireError::Truncated);
    }
    Ok(rest.split_at(len))
}
