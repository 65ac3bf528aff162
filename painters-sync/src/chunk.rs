//! Chunked canvas transfer codec.
//!
//! Wire format (one text frame per chunk):
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │ [MAP/CHUNK:<seq>:<offset>]   │ payload as uppercase hex     │
//! │ header, decimal ASCII        │ 2 chars per source byte      │
//! └──────────────────────────────┴──────────────────────────────┘
//!  ◄──────────────── at most `max_len` bytes ──────────────────►
//! ```
//!
//! The header grows with the sequence id and offset, so each chunk's
//! payload is sized after its own header: `(max_len - header_len) / 2`
//! source bytes. The final chunk carries whatever remains, unpadded.

use std::iter::FusedIterator;

use thiserror::Error;

/// Prefix shared by every chunk frame.
pub const CHUNK_TAG: &str = "[MAP/CHUNK:";

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("Malformed chunk: {0}")]
    Malformed(String),
    #[error("Chunk limit of {max} bytes cannot fit a {header}-byte header plus one payload byte")]
    PayloadTooSmall { max: usize, header: usize },
}

/// One ordered slice of the canvas buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence_id: u32,
    pub byte_offset: usize,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Frame header, e.g. `[MAP/CHUNK:1:56]`.
    pub fn header(&self) -> String {
        header(self.sequence_id, Some(self.byte_offset))
    }

    /// Full wire frame: header followed by the hex-encoded payload.
    pub fn to_wire(&self) -> String {
        let mut wire = self.header();
        wire.push_str(&hex::encode_upper(&self.payload));
        wire
    }

    /// Offset one past the last byte of this chunk.
    pub fn end_offset(&self) -> usize {
        self.byte_offset + self.payload.len()
    }
}

/// A chunk parsed off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    pub sequence_id: u32,
    /// Absent for the legacy `[MAP/CHUNK:<seq>]` header.
    pub byte_offset: Option<usize>,
    pub bytes: Vec<u8>,
}

impl DecodedChunk {
    pub fn to_wire(&self) -> String {
        let mut wire = header(self.sequence_id, self.byte_offset);
        wire.push_str(&hex::encode_upper(&self.bytes));
        wire
    }
}

impl From<Chunk> for DecodedChunk {
    fn from(chunk: Chunk) -> Self {
        Self {
            sequence_id: chunk.sequence_id,
            byte_offset: Some(chunk.byte_offset),
            bytes: chunk.payload,
        }
    }
}

fn header(sequence_id: u32, byte_offset: Option<usize>) -> String {
    match byte_offset {
        Some(offset) => format!("{CHUNK_TAG}{sequence_id}:{offset}]"),
        None => format!("{CHUNK_TAG}{sequence_id}]"),
    }
}

/// Lazy chunk sequence over a borrowed buffer.
///
/// Finite and not restartable; call [`encode`] again for a new session.
#[derive(Debug, Clone)]
pub struct ChunkEncoder<'a> {
    buffer: &'a [u8],
    max_len: usize,
    next_sequence: u32,
    offset: usize,
}

/// Split `buffer` into chunks whose wire form never exceeds `max_len` bytes.
///
/// Fails up front when `max_len` cannot hold the largest header this
/// buffer could need plus one hex-encoded byte.
pub fn encode(buffer: &[u8], max_len: usize) -> Result<ChunkEncoder<'_>, ChunkError> {
    // Every chunk carries at least one byte, so the last chunk has the
    // largest possible sequence id and offset, both at most `len - 1`.
    let bound = buffer.len().saturating_sub(1);
    let worst = header(u32::try_from(bound).unwrap_or(u32::MAX), Some(bound)).len();
    if max_len < worst + 2 {
        return Err(ChunkError::PayloadTooSmall { max: max_len, header: worst });
    }
    Ok(ChunkEncoder {
        buffer,
        max_len,
        next_sequence: 0,
        offset: 0,
    })
}

impl Iterator for ChunkEncoder<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.offset >= self.buffer.len() {
            return None;
        }
        let header_len = header(self.next_sequence, Some(self.offset)).len();
        let capacity = (self.max_len - header_len) / 2;
        let take = capacity.min(self.buffer.len() - self.offset);

        let chunk = Chunk {
            sequence_id: self.next_sequence,
            byte_offset: self.offset,
            payload: self.buffer[self.offset..self.offset + take].to_vec(),
        };
        self.offset += take;
        self.next_sequence += 1;
        Some(chunk)
    }
}

impl FusedIterator for ChunkEncoder<'_> {}

/// Parse one chunk frame.
pub fn decode(wire: &str) -> Result<DecodedChunk, ChunkError> {
    let rest = wire
        .strip_prefix(CHUNK_TAG)
        .ok_or_else(|| ChunkError::Malformed("missing chunk tag".into()))?;
    let (header, payload) = rest
        .split_once(']')
        .ok_or_else(|| ChunkError::Malformed("unterminated header".into()))?;

    let (sequence, offset) = match header.split_once(':') {
        Some((sequence, offset)) => (sequence, Some(offset)),
        None => (header, None),
    };
    let sequence_id = parse_decimal::<u32>(sequence)?;
    let byte_offset = offset.map(parse_decimal::<usize>).transpose()?;

    if payload.len() % 2 != 0 {
        return Err(ChunkError::Malformed(format!(
            "odd payload length {}",
            payload.len()
        )));
    }
    let bytes = hex::decode(payload).map_err(|e| ChunkError::Malformed(e.to_string()))?;

    Ok(DecodedChunk {
        sequence_id,
        byte_offset,
        bytes,
    })
}

fn parse_decimal<T: std::str::FromStr>(field: &str) -> Result<T, ChunkError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ChunkError::Malformed(format!("invalid header field '{field}'")));
    }
    field
        .parse()
        .map_err(|_| ChunkError::Malformed(format!("header field '{field}' out of range")))
}
