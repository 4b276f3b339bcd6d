//! Fragmentation of oversized frames.
//!
//! Transports have a maximum datagram size; a batch that exceeds it is
//! split into bounded fragments tagged by (originator, clock, index) and
//! pieced back together by a [`ReassemblyTable`] on the receiving side.
//! Fragments may arrive in any order, duplicated, or not at all: incomplete
//! sets are retained until completed or evicted by the retention policy,
//! and reliability beyond that is the transport's problem.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use snafu::{ensure, Snafu};
use tracing::{debug, trace};

use super::{
    header::{
        peek_kind, FragmentHeader, FrameFlavor, MessageHeader, MessageKind, ReducedHeader,
    },
    wire::{ReadCursor, WireError, WriteCursor},
};

/// How many clock entries a [`ReassemblyTable`] keeps per originator.
pub const DEFAULT_RETENTION: usize = 5;

/// Failures while splitting a frame.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum FragmentError {
    #[snafu(display("maximum fragment size must be at least 1"))]
    ZeroFragmentSize,
    #[snafu(transparent)]
    Wire { source: WireError },
}

/// Splits an encoded frame into `ceil(len / max_fragment_size)` fragments.
///
/// Each fragment carries a [`FragmentHeader`] whose addressing fields are
/// copied from the frame's own header, whose `size` is the total frame
/// length and whose `updates` field is the fragment count. The last payload
/// may be shorter than `max_fragment_size`.
pub fn split(frame: &[u8], max_fragment_size: usize) -> Result<Vec<Bytes>, FragmentError> {
    ensure!(max_fragment_size >= 1, ZeroFragmentSizeSnafu);

    let mut cursor = ReadCursor::new(frame);
    let (domain, originator, kind, quality, clock) = match peek_kind(frame) {
        Some(FrameFlavor::Message) => {
            let header = MessageHeader::read(&mut cursor)?;
            (
                header.domain,
                header.originator,
                header.kind,
                header.quality,
                header.clock,
            )
        }
        Some(FrameFlavor::Reduced) => {
            let header = ReducedHeader::read(&mut cursor)?;
            (
                String::new(),
                String::new(),
                MessageKind::MultiAssign,
                0,
                header.clock,
            )
        }
        Some(FrameFlavor::Fragment) => return Err(WireError::FragmentedFrame.into()),
        None => return Err(WireError::BadMagic.into()),
    };

    let count = frame.len().div_ceil(max_fragment_size);
    let mut fragments = Vec::with_capacity(count);
    for (index, chunk) in frame.chunks(max_fragment_size).enumerate() {
        let header = FragmentHeader {
            size: frame.len() as u64,
            domain: domain.clone(),
            originator: originator.clone(),
            kind,
            updates: count as u32,
            quality,
            clock,
            index: index as u32,
        };
        let mut buf = vec![0u8; FragmentHeader::ENCODED_LEN + chunk.len()];
        let mut cursor = WriteCursor::new(&mut buf);
        header.write(&mut cursor);
        cursor.put_bytes(chunk);
        debug_assert!(!cursor.overflowed());
        fragments.push(Bytes::from(buf));
    }
    trace!(
        total = frame.len(),
        count,
        max_fragment_size,
        "split frame into fragments"
    );
    Ok(fragments)
}

#[derive(Debug)]
struct FragmentSet {
    /// Declared fragment count.
    total: u32,
    /// Declared size of the reassembled frame.
    size: u64,
    parts: BTreeMap<u32, Bytes>,
}

/// Reassembles fragments per (originator, clock).
///
/// Memory is bounded by keeping only the newest `retention` clock entries
/// per originator; fragments for clocks strictly older than anything
/// tracked are dropped, which also defends against delayed duplicates.
#[derive(Debug)]
pub struct ReassemblyTable {
    retention: usize,
    table: BTreeMap<String, BTreeMap<u64, FragmentSet>>,
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl ReassemblyTable {
    /// A table keeping at most `retention` clock entries per originator.
    pub fn new(retention: usize) -> Self {
        ReassemblyTable {
            retention: retention.max(1),
            table: BTreeMap::new(),
        }
    }

    /// Whether a fragment is worth inserting: its originator is untracked,
    /// or its clock is newer than the newest tracked, or it fills a hole in
    /// a tracked entry.
    pub fn is_valid_entry(&self, originator: &str, clock: u64, index: u32) -> bool {
        match self.table.get(originator) {
            None => true,
            Some(clocks) => {
                let newest = clocks.keys().next_back().copied().unwrap_or(0);
                if clock > newest {
                    true
                } else {
                    clocks
                        .get(&clock)
                        .is_some_and(|set| !set.parts.contains_key(&index))
                }
            }
        }
    }

    /// Inserts a fragment; returns the reassembled frame if this completes
    /// the set for (originator, clock).
    pub fn add_fragment(&mut self, header: &FragmentHeader, payload: Bytes) -> Option<Bytes> {
        if header.updates == 0 || header.index >= header.updates {
            debug!(
                index = header.index,
                total = header.updates,
                "dropping fragment with out-of-range index"
            );
            return None;
        }
        if !self.is_valid_entry(&header.originator, header.clock, header.index) {
            trace!(
                originator = %header.originator,
                clock = header.clock,
                index = header.index,
                "dropping stale or duplicate fragment"
            );
            return None;
        }

        let clocks = self.table.entry(header.originator.clone()).or_default();
        let set = clocks.entry(header.clock).or_insert_with(|| FragmentSet {
            total: header.updates,
            size: header.size,
            parts: BTreeMap::new(),
        });
        set.parts.insert(header.index, payload);

        if (set.parts.len() as u32) < set.total {
            // a fresh clock entry may push older ones past the retention depth
            while clocks.len() > self.retention {
                let oldest = *clocks.keys().next().expect("non-empty");
                clocks.remove(&oldest);
                debug!(
                    originator = %header.originator,
                    clock = oldest,
                    "evicted incomplete fragment entry"
                );
            }
            return None;
        }

        let set = clocks.remove(&header.clock).expect("entry exists");
        if clocks.is_empty() {
            self.table.remove(&header.originator);
        }
        let mut frame = BytesMut::with_capacity(set.size as usize);
        for part in set.parts.values() {
            frame.put_slice(part);
        }
        if frame.len() as u64 != set.size {
            debug!(
                declared = set.size,
                actual = frame.len(),
                "reassembled frame size mismatch; dropping"
            );
            return None;
        }
        debug!(
            originator = %header.originator,
            clock = header.clock,
            size = set.size,
            "reassembled fragmented frame"
        );
        Some(frame.freeze())
    }

    /// Parses a raw fragment frame and inserts it.
    pub fn add_frame(&mut self, frame: Bytes) -> Result<Option<Bytes>, WireError> {
        FragmentHeader::check_len(&frame)?;
        let mut cursor = ReadCursor::new(&frame);
        let header = FragmentHeader::read(&mut cursor)?;
        let payload = frame.slice(FragmentHeader::ENCODED_LEN..);
        Ok(self.add_fragment(&header, payload))
    }

    /// Number of incomplete fragment sets currently tracked.
    pub fn pending(&self) -> usize {
        self.table.values().map(|clocks| clocks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protos::wire::{decode_batch, encode_batch},
        record::{Record, Value},
    };

    fn big_frame(payload_len: usize, clock: u64) -> Bytes {
        let updates = vec![(
            "big".to_string(),
            Record::new(Value::Blob(vec![0xab; payload_len])),
        )];
        let header = MessageHeader {
            originator: "10.0.0.1:50000".into(),
            clock,
            ..Default::default()
        };
        encode_batch(&header, &updates)
    }

    #[test]
    fn split_sizes_and_headers() {
        // 132 header + 16 frame overhead + blob
        let frame = big_frame(149_852, 40);
        assert_eq!(frame.len(), 150_000);

        let fragments = split(&frame, 62_000).unwrap();
        assert_eq!(fragments.len(), 3);

        for (i, fragment) in fragments.iter().enumerate() {
            let header = FragmentHeader::read(&mut ReadCursor::new(fragment)).unwrap();
            assert_eq!(header.index, i as u32);
            assert_eq!(header.updates, 3);
            assert_eq!(header.size, 150_000);
            assert_eq!(header.clock, 40);
            assert_eq!(header.originator, "10.0.0.1:50000");
        }
        assert_eq!(fragments[0].len(), FragmentHeader::ENCODED_LEN + 62_000);
        assert_eq!(fragments[2].len(), FragmentHeader::ENCODED_LEN + 26_000);
    }

    #[test]
    fn out_of_order_reassembly() {
        let frame = big_frame(149_852, 40);
        let fragments = split(&frame, 62_000).unwrap();

        let mut table = ReassemblyTable::default();
        // deliver 2, 0, 1: only the last insertion completes the set
        assert!(table.add_frame(fragments[2].clone()).unwrap().is_none());
        assert!(table.add_frame(fragments[0].clone()).unwrap().is_none());
        let rebuilt = table.add_frame(fragments[1].clone()).unwrap().unwrap();

        assert_eq!(rebuilt.len(), 150_000);
        assert_eq!(&rebuilt[..], &frame[..]);
        assert_eq!(table.pending(), 0);

        // and the rebuilt frame still decodes
        let batch = decode_batch(&rebuilt).unwrap();
        assert_eq!(batch.updates.len(), 1);
    }

    #[test]
    fn duplicates_are_dropped() {
        let frame = big_frame(10_000, 7);
        let fragments = split(&frame, 4_096).unwrap();
        assert_eq!(fragments.len(), 3);

        let mut table = ReassemblyTable::default();
        assert!(table.add_frame(fragments[1].clone()).unwrap().is_none());
        // a duplicate of an already-held index is not a valid entry
        assert!(table.add_frame(fragments[1].clone()).unwrap().is_none());
        assert!(table.add_frame(fragments[0].clone()).unwrap().is_none());
        let rebuilt = table.add_frame(fragments[2].clone()).unwrap().unwrap();
        assert_eq!(&rebuilt[..], &frame[..]);
    }

    #[test]
    fn single_fragment_completes_immediately() {
        let frame = big_frame(100, 3);
        let fragments = split(&frame, 1_000_000).unwrap();
        assert_eq!(fragments.len(), 1);

        let mut table = ReassemblyTable::default();
        let rebuilt = table.add_frame(fragments[0].clone()).unwrap().unwrap();
        assert_eq!(&rebuilt[..], &frame[..]);
    }

    #[test]
    fn older_clocks_are_rejected_and_evicted() {
        let mut table = ReassemblyTable::new(2);

        // leave incomplete sets for clocks 1..=3 from one originator
        for clock in 1..=3u64 {
            let frame = big_frame(10_000, clock);
            let fragments = split(&frame, 4_096).unwrap();
            assert!(table.add_frame(fragments[0].clone()).unwrap().is_none());
        }
        // retention 2 keeps only the two newest clocks
        assert_eq!(table.pending(), 2);
        assert!(!table.is_valid_entry("10.0.0.1:50000", 1, 1));
        assert!(table.is_valid_entry("10.0.0.1:50000", 2, 1));
        assert!(table.is_valid_entry("10.0.0.1:50000", 9, 0));

        // a late fragment for the evicted clock goes nowhere
        let stale = split(&big_frame(10_000, 1), 4_096).unwrap();
        assert!(table.add_frame(stale[1].clone()).unwrap().is_none());
        assert_eq!(table.pending(), 2);

        // the retained clock can still complete
        let fragments = split(&big_frame(10_000, 3), 4_096).unwrap();
        assert!(table.add_frame(fragments[1].clone()).unwrap().is_none());
        let rebuilt = table.add_frame(fragments[2].clone()).unwrap();
        assert!(rebuilt.is_some());
    }

    #[test]
    fn originators_do_not_interfere() {
        let frame_a = big_frame(10_000, 5);
        let frame_b_updates = vec![(
            "big".to_string(),
            Record::new(Value::Blob(vec![0xcd; 10_000])),
        )];
        let header_b = MessageHeader {
            originator: "10.0.0.2:50000".into(),
            clock: 5,
            ..Default::default()
        };
        let frame_b = encode_batch(&header_b, &frame_b_updates);

        let mut table = ReassemblyTable::default();
        let frags_a = split(&frame_a, 4_096).unwrap();
        let frags_b = split(&frame_b, 4_096).unwrap();
        for f in &frags_a[..frags_a.len() - 1] {
            assert!(table.add_frame(f.clone()).unwrap().is_none());
        }
        for f in &frags_b[..frags_b.len() - 1] {
            assert!(table.add_frame(f.clone()).unwrap().is_none());
        }
        let done_a = table.add_frame(frags_a.last().unwrap().clone()).unwrap();
        let done_b = table.add_frame(frags_b.last().unwrap().clone()).unwrap();
        assert_eq!(&done_a.unwrap()[..], &frame_a[..]);
        assert_eq!(&done_b.unwrap()[..], &frame_b[..]);
    }

    #[test]
    fn zero_fragment_size_is_refused() {
        let frame = big_frame(100, 1);
        assert!(matches!(
            split(&frame, 0),
            Err(FragmentError::ZeroFragmentSize)
        ));
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;
    use crate::{protos::wire::encode_reduced_batch, record::Record};

    proptest! {
        #[test]
        fn split_then_reassemble_in_any_order(
            payload in prop::collection::vec(any::<u8>(), 0..2048),
            max_fragment_size in 1usize..512,
            seed in any::<u64>(),
        ) {
            let updates = vec![("k".to_string(), Record::new(payload))];
            let frame = encode_reduced_batch(9, &updates);

            let mut fragments = split(&frame, max_fragment_size).unwrap();
            prop_assert_eq!(
                fragments.len(),
                frame.len().div_ceil(max_fragment_size)
            );

            // shuffle deterministically from the seed
            let mut order: Vec<usize> = (0..fragments.len()).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state % (i as u64 + 1)) as usize);
            }

            let mut table = ReassemblyTable::default();
            let mut rebuilt = None;
            for &i in &order {
                let frag = std::mem::take(&mut fragments[i]);
                if let Some(frame) = table.add_frame(frag).unwrap() {
                    rebuilt = Some(frame);
                }
            }
            let rebuilt = rebuilt.expect("all fragments delivered");
            prop_assert_eq!(&rebuilt[..], &frame[..]);
        }
    }
}
