//! Batch, reduced and fragment headers.
//!
//! Every disseminated frame starts `[u64 size][8-byte magic]`, with the
//! magic at byte offset 8. The three magics share that position, so
//! [`peek_kind`] can classify any frame by testing seven bytes. The full
//! header carries addressing and replication metadata; the reduced variant
//! drops everything a point-to-point link can imply out-of-band; the
//! fragment header is the full header plus a fragment index.

use snafu::ensure;

use super::wire::{
    BadMagicSnafu, ReadCursor, TruncatedSnafu, UnknownMessageKindSnafu, WireError, WriteCursor,
};

/// Magic identifying a full batch header, NUL-padded to 8 bytes.
pub const MESSAGE_MAGIC: &[u8; 8] = b"KaRL1.0\0";
/// Magic identifying a reduced batch header.
pub const REDUCED_MAGIC: &[u8; 8] = b"karl1.2\0";
/// Magic identifying a fragment header.
pub const FRAGMENT_MAGIC: &[u8; 8] = b"KFRG1.3\0";

/// Byte offset of the magic in every frame.
pub const MAGIC_OFFSET: usize = 8;
const MAGIC_TEST_LEN: usize = 7;

/// Width of the fixed domain field.
pub const DOMAIN_LEN: usize = 32;
/// Width of the fixed originator field.
pub const ORIGINATOR_LEN: usize = 64;

/// Default ceiling on a single transport datagram. Larger frames must go
/// through [`crate::protos::fragment::split`].
pub const MAX_PACKET_SIZE: usize = 512_000;

/// Assignment flavor of a batch.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[repr(u32)]
pub enum MessageKind {
    /// A single assignment.
    Assign = 0,
    /// A batch of assignments; the common case.
    #[default]
    MultiAssign = 2,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What kind of frame a buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlavor {
    /// Full batch header.
    Message,
    /// Reduced batch header.
    Reduced,
    /// Fragment of a larger frame.
    Fragment,
}

/// Classifies a frame by the seven magic bytes at [`MAGIC_OFFSET`].
pub fn peek_kind(buf: &[u8]) -> Option<FrameFlavor> {
    let magic = buf.get(MAGIC_OFFSET..MAGIC_OFFSET + MAGIC_TEST_LEN)?;
    if magic == &MESSAGE_MAGIC[..MAGIC_TEST_LEN] {
        Some(FrameFlavor::Message)
    } else if magic == &REDUCED_MAGIC[..MAGIC_TEST_LEN] {
        Some(FrameFlavor::Reduced)
    } else if magic == &FRAGMENT_MAGIC[..MAGIC_TEST_LEN] {
        Some(FrameFlavor::Fragment)
    } else {
        None
    }
}

/// The full batch header.
///
/// ```text
/// [u64 size][8B magic][32B domain][64B originator]
/// [u32 type][u32 updates][u32 quality][u64 clock]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    /// Total frame size, header included.
    pub size: u64,
    /// Domain this batch is addressed to.
    pub domain: String,
    /// `host:port` of the producing process.
    pub originator: String,
    /// Assignment flavor.
    pub kind: MessageKind,
    /// Number of record frames that follow.
    pub updates: u32,
    /// Quality of the sender for this batch.
    pub quality: u32,
    /// Sender clock when the batch was generated.
    pub clock: u64,
}

impl Default for MessageHeader {
    fn default() -> Self {
        MessageHeader {
            size: 0,
            domain: String::new(),
            originator: String::new(),
            kind: MessageKind::MultiAssign,
            updates: 0,
            quality: 0,
            clock: 0,
        }
    }
}

impl MessageHeader {
    /// Encoded size: 8 + 8 + 32 + 64 + 4 + 4 + 4 + 8.
    pub const ENCODED_LEN: usize = 8 + 8 + DOMAIN_LEN + ORIGINATOR_LEN + 4 + 4 + 4 + 8;

    /// Writes the header through `cursor`.
    pub fn write(&self, cursor: &mut WriteCursor<'_>) {
        cursor.put_u64(self.size);
        cursor.put_bytes(MESSAGE_MAGIC);
        cursor.put_fixed_text(&self.domain, DOMAIN_LEN);
        cursor.put_fixed_text(&self.originator, ORIGINATOR_LEN);
        cursor.put_u32(self.kind.into());
        cursor.put_u32(self.updates);
        cursor.put_u32(self.quality);
        cursor.put_u64(self.clock);
    }

    /// Reads a header, validating the magic.
    pub fn read(cursor: &mut ReadCursor<'_>) -> Result<Self, WireError> {
        let size = cursor.u64()?;
        let magic = cursor.take(8)?;
        ensure!(magic[..MAGIC_TEST_LEN] == MESSAGE_MAGIC[..MAGIC_TEST_LEN], BadMagicSnafu);
        let domain = cursor.fixed_text(DOMAIN_LEN)?;
        let originator = cursor.fixed_text(ORIGINATOR_LEN)?;
        let kind = cursor.u32()?;
        let kind =
            MessageKind::try_from(kind).map_err(|_| UnknownMessageKindSnafu { kind }.build())?;
        let updates = cursor.u32()?;
        let quality = cursor.u32()?;
        let clock = cursor.u64()?;
        Ok(MessageHeader {
            size,
            domain,
            originator,
            kind,
            updates,
            quality,
            clock,
        })
    }
}

/// The reduced batch header: `[u64 size][8B magic][u32 updates][u64 clock]`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReducedHeader {
    /// Total frame size, header included.
    pub size: u64,
    /// Number of record frames that follow.
    pub updates: u32,
    /// Sender clock when the batch was generated.
    pub clock: u64,
}

impl ReducedHeader {
    /// Encoded size: 8 + 8 + 4 + 8.
    pub const ENCODED_LEN: usize = 8 + 8 + 4 + 8;

    /// Writes the header through `cursor`.
    pub fn write(&self, cursor: &mut WriteCursor<'_>) {
        cursor.put_u64(self.size);
        cursor.put_bytes(REDUCED_MAGIC);
        cursor.put_u32(self.updates);
        cursor.put_u64(self.clock);
    }

    /// Reads a header, validating the magic.
    pub fn read(cursor: &mut ReadCursor<'_>) -> Result<Self, WireError> {
        let size = cursor.u64()?;
        let magic = cursor.take(8)?;
        ensure!(magic[..MAGIC_TEST_LEN] == REDUCED_MAGIC[..MAGIC_TEST_LEN], BadMagicSnafu);
        let updates = cursor.u32()?;
        let clock = cursor.u64()?;
        Ok(ReducedHeader {
            size,
            updates,
            clock,
        })
    }
}

/// The fragment header: the full header layout under the fragment magic,
/// followed by the fragment index.
///
/// `size` carries the total size of the *un-fragmented* frame and `updates`
/// the total fragment count, so reassembly can decide completeness no
/// matter which fragment arrives first.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentHeader {
    /// Total size of the original, un-fragmented frame.
    pub size: u64,
    /// Domain copied from the original frame.
    pub domain: String,
    /// Originator copied from the original frame; the reassembly namespace.
    pub originator: String,
    /// Assignment flavor of the original frame.
    pub kind: MessageKind,
    /// Total number of fragments.
    pub updates: u32,
    /// Quality copied from the original frame.
    pub quality: u32,
    /// Clock of the original frame; identifies the fragment set.
    pub clock: u64,
    /// Position of this fragment, `0..updates`.
    pub index: u32,
}

impl FragmentHeader {
    /// Encoded size: the full header plus the index field.
    pub const ENCODED_LEN: usize = MessageHeader::ENCODED_LEN + 4;

    /// Writes the header through `cursor`.
    pub fn write(&self, cursor: &mut WriteCursor<'_>) {
        cursor.put_u64(self.size);
        cursor.put_bytes(FRAGMENT_MAGIC);
        cursor.put_fixed_text(&self.domain, DOMAIN_LEN);
        cursor.put_fixed_text(&self.originator, ORIGINATOR_LEN);
        cursor.put_u32(self.kind.into());
        cursor.put_u32(self.updates);
        cursor.put_u32(self.quality);
        cursor.put_u64(self.clock);
        cursor.put_u32(self.index);
    }

    /// Reads a header, validating the magic.
    pub fn read(cursor: &mut ReadCursor<'_>) -> Result<Self, WireError> {
        let size = cursor.u64()?;
        let magic = cursor.take(8)?;
        ensure!(magic[..MAGIC_TEST_LEN] == FRAGMENT_MAGIC[..MAGIC_TEST_LEN], BadMagicSnafu);
        let domain = cursor.fixed_text(DOMAIN_LEN)?;
        let originator = cursor.fixed_text(ORIGINATOR_LEN)?;
        let kind = cursor.u32()?;
        let kind =
            MessageKind::try_from(kind).map_err(|_| UnknownMessageKindSnafu { kind }.build())?;
        let updates = cursor.u32()?;
        let quality = cursor.u32()?;
        let clock = cursor.u64()?;
        let index = cursor.u32()?;
        Ok(FragmentHeader {
            size,
            domain,
            originator,
            kind,
            updates,
            quality,
            clock,
            index,
        })
    }

    /// Ensures `buf` is at least one whole header.
    pub(crate) fn check_len(buf: &[u8]) -> Result<(), WireError> {
        ensure!(
            buf.len() >= Self::ENCODED_LEN,
            TruncatedSnafu {
                needed: Self::ENCODED_LEN,
                available: buf.len(),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_to_vec(len: usize, write: impl FnOnce(&mut WriteCursor<'_>)) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut cursor = WriteCursor::new(&mut buf);
        write(&mut cursor);
        assert!(!cursor.overflowed());
        assert_eq!(cursor.position(), len);
        buf
    }

    #[test]
    fn message_header_round_trip() {
        let header = MessageHeader {
            size: 4096,
            domain: "vehicles".into(),
            originator: "10.0.0.7:50001".into(),
            kind: MessageKind::MultiAssign,
            updates: 12,
            quality: 3,
            clock: 99,
        };
        let buf = write_to_vec(MessageHeader::ENCODED_LEN, |c| header.write(c));
        assert_eq!(peek_kind(&buf), Some(FrameFlavor::Message));

        let decoded = MessageHeader::read(&mut ReadCursor::new(&buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn reduced_header_round_trip() {
        let header = ReducedHeader {
            size: 64,
            updates: 2,
            clock: 7,
        };
        let buf = write_to_vec(ReducedHeader::ENCODED_LEN, |c| header.write(c));
        assert_eq!(buf.len(), 28);
        assert_eq!(peek_kind(&buf), Some(FrameFlavor::Reduced));

        let decoded = ReducedHeader::read(&mut ReadCursor::new(&buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn fragment_header_round_trip() {
        let header = FragmentHeader {
            size: 150_000,
            domain: String::new(),
            originator: "10.0.0.7:50001".into(),
            kind: MessageKind::MultiAssign,
            updates: 3,
            quality: 1,
            clock: 40,
            index: 2,
        };
        let buf = write_to_vec(FragmentHeader::ENCODED_LEN, |c| header.write(c));
        assert_eq!(buf.len(), 136);
        assert_eq!(peek_kind(&buf), Some(FrameFlavor::Fragment));

        let decoded = FragmentHeader::read(&mut ReadCursor::new(&buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn magic_sits_at_offset_eight() {
        let buf = write_to_vec(MessageHeader::ENCODED_LEN, |c| {
            MessageHeader::default().write(c)
        });
        assert_eq!(&buf[8..15], b"KaRL1.0");

        // mismatched magic refuses to parse as the other flavors
        assert!(ReducedHeader::read(&mut ReadCursor::new(&buf)).is_err());
        assert!(FragmentHeader::read(&mut ReadCursor::new(&buf)).is_err());
        // and garbage is classified as neither
        assert_eq!(peek_kind(b"short"), None);
        assert_eq!(peek_kind(&[0u8; 64]), None);
    }

    #[test]
    fn over_long_text_fields_are_clipped() {
        let header = MessageHeader {
            originator: "x".repeat(200),
            ..Default::default()
        };
        let buf = write_to_vec(MessageHeader::ENCODED_LEN, |c| header.write(c));
        let decoded = MessageHeader::read(&mut ReadCursor::new(&buf)).unwrap();
        // clipped to the field width, minus the guaranteed terminator
        assert_eq!(decoded.originator.len(), ORIGINATOR_LEN - 1);
    }

    #[test]
    fn unknown_message_kind_is_rejected() {
        let mut buf = write_to_vec(MessageHeader::ENCODED_LEN, |c| {
            MessageHeader::default().write(c)
        });
        buf[112..116].copy_from_slice(&7u32.to_be_bytes());
        let err = MessageHeader::read(&mut ReadCursor::new(&buf)).unwrap_err();
        assert!(matches!(err, WireError::UnknownMessageKind { kind: 7 }));
    }
}
