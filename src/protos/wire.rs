//! Record frame codec.
//!
//! One frame per (key, record) pair, all multi-byte integers big-endian:
//!
//! ```text
//! [u32 key_len][key bytes incl. NUL][u32 type_tag][u32 value_len][value bytes]
//! ```
//!
//! `key_len` counts the key's bytes plus its NUL terminator. `value_len`
//! for text includes a trailing NUL; blobs are raw; scalars are 8 bytes and
//! arrays 8 bytes per element.
//!
//! Writing goes through [`WriteCursor`], which tracks the remaining
//! capacity of a caller-supplied buffer as a *signed* count: a field that
//! does not fit is skipped, but the count still decrements by the field's
//! true size, so a negative final count tells the caller exactly how much
//! to reallocate. The `value_len` field is reserved as a placeholder and
//! patched once the value bytes are down, since the value's encoded length
//! is only known after writing it.

use bytes::Bytes;
use snafu::Snafu;

use super::header::{peek_kind, FrameFlavor, MessageHeader, MessageKind, ReducedHeader};
use crate::record::{max_quality, Record, Value, ValueKind};

/// Decode-side failures.
///
/// Policy rejections never appear here; those are store outcomes. These are
/// malformed-input conditions: the caller decides whether a short parse is
/// usable.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum WireError {
    #[snafu(display("buffer truncated: needed {needed} bytes, {available} available"))]
    Truncated { needed: usize, available: usize },
    #[snafu(display("unknown value tag {tag}"))]
    UnknownTag { tag: u32 },
    #[snafu(display("value length {len} is invalid for {kind}"))]
    InvalidLength { kind: ValueKind, len: u32 },
    #[snafu(display("key is not valid UTF-8"))]
    InvalidKey,
    #[snafu(display("unrecognized magic in frame header"))]
    BadMagic,
    #[snafu(display("unknown message type {kind}"))]
    UnknownMessageKind { kind: u32 },
    #[snafu(display("frame is a fragment; reassemble it first"))]
    FragmentedFrame,
}

/// Capacity-tracked writer over a caller-supplied buffer.
#[derive(Debug)]
pub struct WriteCursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
    remaining: i64,
}

impl<'a> WriteCursor<'a> {
    /// A cursor over the whole of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let remaining = buf.len() as i64;
        WriteCursor {
            buf,
            pos: 0,
            remaining,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Remaining capacity; negative once any field has been skipped.
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// True once a field did not fit. The written prefix is not a valid
    /// frame; reallocate by `-remaining()` extra bytes and start over.
    pub fn overflowed(&self) -> bool {
        self.remaining < 0
    }

    /// Writes raw bytes, or skips them while still consuming capacity.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if self.remaining >= bytes.len() as i64 {
            self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
            self.pos += bytes.len();
        }
        self.remaining -= bytes.len() as i64;
    }

    /// Writes one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    /// Writes a big-endian u32.
    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    /// Writes a big-endian u64.
    pub fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_be_bytes());
    }

    /// Writes `text` into a fixed-width field, NUL-padded, clipped to
    /// `width - 1` bytes so the field always terminates.
    pub fn put_fixed_text(&mut self, text: &str, width: usize) {
        if self.remaining >= width as i64 {
            let take = text.len().min(width - 1);
            self.buf[self.pos..self.pos + take].copy_from_slice(&text.as_bytes()[..take]);
            self.buf[self.pos + take..self.pos + width].fill(0);
            self.pos += width;
        }
        self.remaining -= width as i64;
    }

    /// Reserves a u32 slot to be patched later. `None` when it did not fit;
    /// capacity is consumed either way.
    pub fn reserve_u32(&mut self) -> Option<usize> {
        let slot = self.pos;
        if self.remaining >= 4 {
            self.pos += 4;
            self.remaining -= 4;
            Some(slot)
        } else {
            self.remaining -= 4;
            None
        }
    }

    /// Backfills a slot returned by [`WriteCursor::reserve_u32`].
    pub fn patch_u32(&mut self, slot: usize, value: u32) {
        self.buf[slot..slot + 4].copy_from_slice(&value.to_be_bytes());
    }
}

/// Bounds-checked reader over an encoded frame.
#[derive(Debug)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    /// A cursor over the whole of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        ReadCursor { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the cursor to an absolute position, clamped to the buffer.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Takes `n` raw bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Reads a big-endian u32.
    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    /// Reads a big-endian u64.
    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    /// Reads a fixed-width NUL-padded text field.
    pub fn fixed_text(&mut self, width: usize) -> Result<String, WireError> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Exact encoded size of one (key, record) frame.
pub fn encoded_size(key: &str, record: &Record) -> usize {
    4 + key.len() + 1 + 4 + 4 + record.value.wire_size() as usize
}

/// Encodes one (key, record) frame through `cursor`.
///
/// On overflow the cursor keeps decrementing so the caller can size a
/// retry; check [`WriteCursor::overflowed`] before trusting the output.
pub fn encode_record(cursor: &mut WriteCursor<'_>, key: &str, record: &Record) {
    cursor.put_u32(key.len() as u32 + 1);
    cursor.put_bytes(key.as_bytes());
    cursor.put_u8(0);
    cursor.put_u32(record.kind().into());

    // the value's length is only known once it has been written
    let slot = cursor.reserve_u32();
    let start = cursor.position();
    match &record.value {
        Value::Integer(i) => cursor.put_u64(*i as u64),
        Value::Double(d) => cursor.put_u64(d.to_bits()),
        Value::Text(s) => {
            cursor.put_bytes(s.as_bytes());
            cursor.put_u8(0);
        }
        Value::Blob(b) => cursor.put_bytes(b),
        Value::IntegerArray(a) => {
            for v in a {
                cursor.put_u64(*v as u64);
            }
        }
        Value::DoubleArray(a) => {
            for v in a {
                cursor.put_u64(v.to_bits());
            }
        }
    }
    if let Some(slot) = slot {
        if !cursor.overflowed() {
            let len = (cursor.position() - start) as u32;
            cursor.patch_u32(slot, len);
        }
    }
}

/// Encodes one frame into a freshly sized vector.
pub fn encode_record_vec(key: &str, record: &Record) -> Vec<u8> {
    let mut buf = vec![0u8; encoded_size(key, record)];
    let mut cursor = WriteCursor::new(&mut buf);
    encode_record(&mut cursor, key, record);
    debug_assert!(!cursor.overflowed());
    let position = cursor.position();
    drop(cursor);
    buf.truncate(position);
    buf
}

/// Decodes one (key, record) frame.
///
/// Clock and quality are not carried per frame; the surrounding batch
/// header supplies them, so they come back zeroed here.
pub fn decode_record(cursor: &mut ReadCursor<'_>) -> Result<(String, Record), WireError> {
    let key_len = cursor.u32()? as usize;
    let key_raw = cursor.take(key_len)?;
    let key_end = key_raw.iter().position(|&b| b == 0).unwrap_or(key_len);
    let key = std::str::from_utf8(&key_raw[..key_end])
        .map_err(|_| WireError::InvalidKey)?
        .to_owned();

    let tag = cursor.u32()?;
    let kind = ValueKind::try_from(tag).map_err(|_| WireError::UnknownTag { tag })?;
    let len = cursor.u32()?;
    let raw = cursor.take(len as usize)?;

    let value = match kind {
        ValueKind::Integer => {
            if len != 8 {
                return Err(WireError::InvalidLength { kind, len });
            }
            Value::Integer(u64::from_be_bytes(raw.try_into().expect("8 bytes")) as i64)
        }
        ValueKind::Double => {
            if len != 8 {
                return Err(WireError::InvalidLength { kind, len });
            }
            Value::Double(f64::from_bits(u64::from_be_bytes(
                raw.try_into().expect("8 bytes"),
            )))
        }
        ValueKind::Text => {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Value::Text(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
        ValueKind::Blob => Value::Blob(raw.to_vec()),
        ValueKind::IntegerArray => {
            if len % 8 != 0 {
                return Err(WireError::InvalidLength { kind, len });
            }
            Value::IntegerArray(
                raw.chunks_exact(8)
                    .map(|c| u64::from_be_bytes(c.try_into().expect("8 bytes")) as i64)
                    .collect(),
            )
        }
        ValueKind::DoubleArray => {
            if len % 8 != 0 {
                return Err(WireError::InvalidLength { kind, len });
            }
            Value::DoubleArray(
                raw.chunks_exact(8)
                    .map(|c| f64::from_bits(u64::from_be_bytes(c.try_into().expect("8 bytes"))))
                    .collect(),
            )
        }
    };

    Ok((key, Record::new(value)))
}

/// A decoded batch of updates.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Domain the batch was addressed to; empty for reduced headers.
    pub domain: String,
    /// `host:port` of the producing process; empty for reduced headers.
    pub originator: String,
    /// Assignment flavor of the batch.
    pub kind: MessageKind,
    /// Batch quality, stamped onto every decoded record.
    pub quality: u32,
    /// Sender clock, stamped onto every decoded record.
    pub clock: u64,
    /// The decoded (key, record) pairs, in frame order.
    pub updates: Vec<(String, Record)>,
}

/// Encodes a batch: a full [`MessageHeader`] followed by one frame per
/// update.
///
/// The header's `size`, `updates` and `quality` fields are computed from
/// the update set; the remaining fields are taken from `header`.
pub fn encode_batch(header: &MessageHeader, updates: &[(String, Record)]) -> Bytes {
    let body: usize = updates
        .iter()
        .map(|(k, r)| encoded_size(k, r))
        .sum::<usize>();
    let total = MessageHeader::ENCODED_LEN + body;

    let stamped = MessageHeader {
        size: total as u64,
        updates: updates.len() as u32,
        quality: max_quality(updates.iter().map(|(_, r)| r)),
        ..header.clone()
    };

    let mut buf = vec![0u8; total];
    let mut cursor = WriteCursor::new(&mut buf);
    stamped.write(&mut cursor);
    for (key, record) in updates {
        encode_record(&mut cursor, key, record);
    }
    debug_assert!(!cursor.overflowed());
    Bytes::from(buf)
}

/// Encodes a batch under the reduced header, for links where domain and
/// originator are implied out-of-band.
pub fn encode_reduced_batch(clock: u64, updates: &[(String, Record)]) -> Bytes {
    let body: usize = updates
        .iter()
        .map(|(k, r)| encoded_size(k, r))
        .sum::<usize>();
    let total = ReducedHeader::ENCODED_LEN + body;

    let header = ReducedHeader {
        size: total as u64,
        updates: updates.len() as u32,
        clock,
    };

    let mut buf = vec![0u8; total];
    let mut cursor = WriteCursor::new(&mut buf);
    header.write(&mut cursor);
    for (key, record) in updates {
        encode_record(&mut cursor, key, record);
    }
    debug_assert!(!cursor.overflowed());
    Bytes::from(buf)
}

/// Decodes a batch frame carrying either header variant.
///
/// Truncated input yields the complete prefix of updates rather than an
/// error: partial data is data. A fragment frame is refused; reassemble it
/// first.
pub fn decode_batch(buf: &[u8]) -> Result<Batch, WireError> {
    let mut cursor = ReadCursor::new(buf);
    let (mut batch, declared) = match peek_kind(buf) {
        Some(FrameFlavor::Message) => {
            let header = MessageHeader::read(&mut cursor)?;
            (
                Batch {
                    domain: header.domain,
                    originator: header.originator,
                    kind: header.kind,
                    quality: header.quality,
                    clock: header.clock,
                    updates: Vec::new(),
                },
                header.updates,
            )
        }
        Some(FrameFlavor::Reduced) => {
            let header = ReducedHeader::read(&mut cursor)?;
            (
                Batch {
                    domain: String::new(),
                    originator: String::new(),
                    kind: MessageKind::MultiAssign,
                    quality: 0,
                    clock: header.clock,
                    updates: Vec::new(),
                },
                header.updates,
            )
        }
        Some(FrameFlavor::Fragment) => return Err(WireError::FragmentedFrame),
        None => return Err(WireError::BadMagic),
    };

    for _ in 0..declared {
        match decode_record(&mut cursor) {
            Ok((key, mut record)) => {
                record.clock = batch.clock;
                record.quality = batch.quality;
                batch.updates.push((key, record));
            }
            // short read: keep what parsed
            Err(WireError::Truncated { .. }) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(batch)
}
