//! File checkpointing.
//!
//! A checkpoint file is a small header followed by one or more segments,
//! each segment a batch header plus record frames, the same encoding the
//! wire uses:
//!
//! ```text
//! [8B magic "KCHK1.0"][u32 segment count][64B originator]
//! ( [MessageHeader][record frames ...] )*
//! ```
//!
//! Loading a checkpoint is defined as replaying it: every record goes
//! through [`KnowledgeStore::apply`] in file order, as if it had arrived
//! from the checkpoint's originator. Saving holds the store lock for the
//! duration, which buys a consistent snapshot at the cost of blocking
//! writers; swap in a copy-then-release strategy if that trade ever turns
//! the wrong way.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use snafu::{ensure, Snafu};
use tracing::debug;

use crate::{
    protos::{
        header::{MessageHeader, MessageKind, ORIGINATOR_LEN},
        wire::{self, ReadCursor, WriteCursor},
    },
    record::{Record, Scope},
    settings::CheckpointSettings,
    store::KnowledgeStore,
};

/// Magic identifying a checkpoint file.
pub const CHECKPOINT_MAGIC: &[u8; 8] = b"KCHK1.0\0";

/// Encoded size of the file header.
pub const FILE_HEADER_LEN: usize = 8 + 4 + ORIGINATOR_LEN;

const MAGIC_TEST_LEN: usize = 7;

/// Checkpoint failures.
///
/// An unopenable or unreadable file surfaces as `Io`; a file that opens but
/// is not a checkpoint surfaces as `BadFileMagic`. Neither mutates the
/// store, so scheduled checkpoint passes degrade gracefully.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum CheckpointError {
    #[snafu(context(false), display("checkpoint i/o failed: {source}"))]
    Io { source: std::io::Error },
    #[snafu(display("not a checkpoint file: bad magic"))]
    BadFileMagic,
    #[snafu(display("checkpoint file header is truncated"))]
    ShortHeader,
}

/// What a save pass wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveSummary {
    /// Bytes written for the new segment, header included.
    pub bytes: u64,
    /// Records written into the new segment.
    pub records: u32,
    /// Total segments now in the file.
    pub segments: u32,
}

/// What a load pass replayed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    /// Segments read.
    pub segments: u32,
    /// Updates accepted (applied or already identical).
    pub applied: u32,
    /// Updates rejected by conflict resolution.
    pub rejected: u32,
}

fn write_file_header(
    file: &mut File,
    segments: u32,
    originator: &str,
) -> Result<(), CheckpointError> {
    let mut buf = [0u8; FILE_HEADER_LEN];
    let mut cursor = WriteCursor::new(&mut buf);
    cursor.put_bytes(CHECKPOINT_MAGIC);
    cursor.put_u32(segments);
    cursor.put_fixed_text(originator, ORIGINATOR_LEN);
    debug_assert!(!cursor.overflowed());
    file.write_all(&buf)?;
    Ok(())
}

fn write_message_header(file: &mut File, header: &MessageHeader) -> Result<(), CheckpointError> {
    let mut buf = [0u8; MessageHeader::ENCODED_LEN];
    let mut cursor = WriteCursor::new(&mut buf);
    header.write(&mut cursor);
    debug_assert!(!cursor.overflowed());
    file.write_all(&buf)?;
    Ok(())
}

/// Streams one segment through a bounded reusable buffer, then patches the
/// segment header in place with the final size, count and quality.
fn write_segment<'a, I>(
    file: &mut File,
    clock: u64,
    records: I,
    settings: &CheckpointSettings,
) -> Result<(u64, u32), CheckpointError>
where
    I: Iterator<Item = (&'a str, &'a Record)>,
{
    let segment_start = file.stream_position()?;
    let mut header = MessageHeader {
        size: 0,
        domain: settings.domain.clone(),
        originator: settings.originator.clone(),
        kind: MessageKind::MultiAssign,
        updates: 0,
        quality: 0,
        clock,
    };
    // placeholder; rewritten once the stream is done
    write_message_header(file, &header)?;

    let mut buf = vec![0u8; settings.buffer_size.max(1)];
    let mut used = 0;
    let mut count = 0u32;
    let mut quality = 0u32;
    let mut bytes = MessageHeader::ENCODED_LEN as u64;

    for (key, record) in records {
        let need = wire::encoded_size(key, record);
        if used + need > buf.len() {
            file.write_all(&buf[..used])?;
            used = 0;
        }
        // grows only when a single record cannot fit the buffer at all
        if need > buf.len() {
            buf.resize(need, 0);
        }
        let mut cursor = WriteCursor::new(&mut buf[used..used + need]);
        wire::encode_record(&mut cursor, key, record);
        debug_assert!(!cursor.overflowed());
        used += cursor.position();
        bytes += need as u64;
        count += 1;
        quality = quality.max(record.quality);
    }
    file.write_all(&buf[..used])?;

    header.size = bytes;
    header.updates = count;
    header.quality = quality;
    let end = file.stream_position()?;
    file.seek(SeekFrom::Start(segment_start))?;
    write_message_header(file, &header)?;
    file.seek(SeekFrom::Start(end))?;
    Ok((bytes, count))
}

fn save_full(
    state: &mut crate::store::State,
    path: &Path,
    settings: &CheckpointSettings,
) -> Result<SaveSummary, CheckpointError> {
    let mut file = File::create(path)?;
    write_file_header(&mut file, 1, &settings.originator)?;

    let records = state
        .records
        .iter()
        .filter(|(_, record)| record.scope == Scope::Global)
        .map(|(key, record)| (key.as_str(), record));
    let (bytes, count) = write_segment(&mut file, state.clock, records, settings)?;
    file.flush()?;

    state.ckpt_modified.clear();
    state.ckpt_modified_local.clear();
    debug!(path = %path.display(), bytes, records = count, "saved checkpoint");
    Ok(SaveSummary {
        bytes,
        records: count,
        segments: 1,
    })
}

/// Saves a full snapshot of every global-scope record, replacing `path`.
///
/// Holds the store lock for the duration. Clears the modified-since-last-
/// checkpoint tracking; the dissemination set is untouched.
pub fn save(
    store: &KnowledgeStore,
    path: impl AsRef<Path>,
    settings: &CheckpointSettings,
) -> Result<SaveSummary, CheckpointError> {
    let mut state = store.state();
    save_full(&mut state, path.as_ref(), settings)
}

/// Appends a segment holding only the records modified since the last
/// checkpoint pass (both global- and local-scope), then rewrites the file
/// header's segment count in place.
///
/// Falls back to a full [`save`] when `path` does not exist yet.
pub fn save_incremental(
    store: &KnowledgeStore,
    path: impl AsRef<Path>,
    settings: &CheckpointSettings,
) -> Result<SaveSummary, CheckpointError> {
    let path = path.as_ref();
    let mut state = store.state();
    if !path.exists() {
        return save_full(&mut state, path, settings);
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut header = [0u8; FILE_HEADER_LEN];
    file.read_exact(&mut header)?;
    ensure!(
        header[..MAGIC_TEST_LEN] == CHECKPOINT_MAGIC[..MAGIC_TEST_LEN],
        BadFileMagicSnafu
    );
    let segments = u32::from_be_bytes(header[8..12].try_into().expect("4 bytes"));

    file.seek(SeekFrom::End(0))?;
    let state = &mut *state;
    let records = state
        .ckpt_modified
        .iter()
        .chain(state.ckpt_modified_local.iter())
        .filter_map(|key| {
            state
                .records
                .get(key)
                .map(|record| (key.as_str(), record))
        });
    let (bytes, count) = write_segment(&mut file, state.clock, records, settings)?;

    // bump the declared segment count in place
    file.seek(SeekFrom::Start(8))?;
    file.write_all(&(segments + 1).to_be_bytes())?;
    file.flush()?;

    state.ckpt_modified.clear();
    state.ckpt_modified_local.clear();
    debug!(
        path = %path.display(),
        bytes,
        records = count,
        segments = segments + 1,
        "appended checkpoint segment"
    );
    Ok(SaveSummary {
        bytes,
        records: count,
        segments: segments + 1,
    })
}

/// Replays a checkpoint file into the store.
///
/// The file magic is validated before anything mutates; each declared
/// segment then replays its declared update count through the normal
/// conflict-resolution path, with the segment header supplying clock and
/// quality. A truncated segment is consumed up to the last complete record
/// and the remainder silently discarded: partial data is data.
pub fn load(
    store: &KnowledgeStore,
    path: impl AsRef<Path>,
    settings: &CheckpointSettings,
) -> Result<LoadSummary, CheckpointError> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    ensure!(data.len() >= FILE_HEADER_LEN, ShortHeaderSnafu);
    ensure!(
        data[..MAGIC_TEST_LEN] == CHECKPOINT_MAGIC[..MAGIC_TEST_LEN],
        BadFileMagicSnafu
    );
    let declared_segments = u32::from_be_bytes(data[8..12].try_into().expect("4 bytes"));

    let mut summary = LoadSummary::default();
    let mut state = store.state();
    let mut cursor = ReadCursor::new(&data);
    cursor.seek(FILE_HEADER_LEN);

    for _ in 0..declared_segments {
        let segment_start = cursor.position();
        let header = match MessageHeader::read(&mut cursor) {
            Ok(header) => header,
            // a short or mangled trailing segment is discarded
            Err(_) => break,
        };
        let end = segment_start
            .saturating_add(header.size as usize)
            .min(data.len());

        for _ in 0..header.updates {
            let (key, mut record) = match wire::decode_record(&mut cursor) {
                Ok(decoded) => decoded,
                Err(_) => break,
            };
            if cursor.position() > end {
                break;
            }
            record.clock = header.clock;
            record.quality = header.quality;
            let outcome = store.apply_with_state(&mut state, &key, record, &settings.update);
            if outcome.accepted() {
                summary.applied += 1;
            } else {
                summary.rejected += 1;
            }
        }
        cursor.seek(end);
        summary.segments += 1;
    }
    debug!(
        path = %path.display(),
        segments = summary.segments,
        applied = summary.applied,
        rejected = summary.rejected,
        "loaded checkpoint"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::{Status, Value},
        settings::UpdateSettings,
        store::UpdateOutcome,
    };

    fn sample_store() -> KnowledgeStore {
        let store = KnowledgeStore::new();
        let s = UpdateSettings::default();
        let _ = store.set("alpha", 7i64, &s);
        let _ = store.set("beta", "hello", &s);
        let _ = store.set("gamma", Value::DoubleArray(vec![1.5, -2.5]), &s);
        let _ = store.set(".hidden", 42i64, &s);
        store
    }

    #[test]
    fn save_then_load_round_trips_global_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");

        let source = sample_store();
        let saved = save(&source, &path, &CheckpointSettings::with_originator("a:1")).unwrap();
        assert_eq!(saved.records, 3);
        assert_eq!(saved.segments, 1);

        let target = KnowledgeStore::new();
        let loaded = load(&target, &path, &CheckpointSettings::default()).unwrap();
        assert_eq!(loaded.applied, 3);
        assert_eq!(loaded.rejected, 0);

        assert_eq!(target.get("alpha").to_integer(), 7);
        assert_eq!(target.get("beta").to_text(), "hello");
        assert_eq!(
            target.get("gamma").value,
            Value::DoubleArray(vec![1.5, -2.5])
        );
        // local-scope records never make it into a full snapshot
        assert!(!target.exists(".hidden"));
        // replayed records carry the segment clock
        assert_eq!(target.get("alpha").clock, source.clock());
    }

    #[test]
    fn loading_replays_through_conflict_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");

        let source = KnowledgeStore::new();
        let _ = source.set("x", 1i64, &UpdateSettings::default());
        save(&source, &path, &CheckpointSettings::default()).unwrap();

        // the target already holds x at a higher quality
        let target = KnowledgeStore::new();
        let outcome = target.apply(
            "x",
            Record::with_meta(99i64, 1, 8),
            &UpdateSettings::default(),
        );
        assert_eq!(outcome, UpdateOutcome::Applied);

        let loaded = load(&target, &path, &CheckpointSettings::default()).unwrap();
        assert_eq!(loaded.rejected, 1);
        assert_eq!(loaded.applied, 0);
        assert_eq!(target.get("x").to_integer(), 99);
    }

    #[test]
    fn incremental_appends_modified_records_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");
        let settings = CheckpointSettings::default();
        let update = UpdateSettings::default();

        let source = sample_store();
        save(&source, &path, &settings).unwrap();

        // only these two change after the full snapshot
        let _ = source.set("alpha", 8i64, &update);
        let _ = source.set(".hidden", 43i64, &update);
        let saved = save_incremental(&source, &path, &settings).unwrap();
        assert_eq!(saved.segments, 2);
        assert_eq!(saved.records, 2);

        let target = KnowledgeStore::new();
        let loaded = load(&target, &path, &settings).unwrap();
        assert_eq!(loaded.segments, 2);
        assert_eq!(target.get("alpha").to_integer(), 8);
        assert_eq!(target.get("beta").to_text(), "hello");
        // the diff segment carries local-scope modifications too
        assert_eq!(target.get(".hidden").to_integer(), 43);

        // a second incremental with nothing modified appends an empty segment
        let saved = save_incremental(&source, &path, &settings).unwrap();
        assert_eq!(saved.records, 0);
        assert_eq!(saved.segments, 3);
    }

    #[test]
    fn incremental_on_missing_file_saves_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");

        let source = sample_store();
        let saved = save_incremental(&source, &path, &CheckpointSettings::default()).unwrap();
        assert_eq!(saved.segments, 1);
        assert_eq!(saved.records, 3);
    }

    #[test]
    fn truncated_segment_keeps_complete_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");

        let source = sample_store();
        save(&source, &path, &CheckpointSettings::default()).unwrap();

        // chop into the middle of the last record
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 6]).unwrap();

        let target = KnowledgeStore::new();
        let loaded = load(&target, &path, &CheckpointSettings::default()).unwrap();
        assert_eq!(loaded.applied, 2);
        assert!(target.exists("alpha"));
        assert!(target.exists("beta"));
        assert!(!target.exists("gamma"));
    }

    #[test]
    fn corrupt_magic_aborts_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");
        std::fs::write(&path, b"definitely not a checkpoint file").unwrap();

        let target = KnowledgeStore::new();
        let err = load(&target, &path, &CheckpointSettings::default()).unwrap_err();
        assert!(matches!(err, CheckpointError::BadFileMagic));
        assert!(target.is_empty());
    }

    #[test]
    fn missing_file_is_a_branchable_error() {
        let target = KnowledgeStore::new();
        let err = load(
            &target,
            "/no/such/checkpoint.kb",
            &CheckpointSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }

    #[test]
    fn tiny_buffer_still_streams_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");
        let settings = CheckpointSettings {
            // smaller than any single record encoding, so it must grow
            buffer_size: 4,
            ..Default::default()
        };

        let source = sample_store();
        let saved = save(&source, &path, &settings).unwrap();
        assert_eq!(saved.records, 3);

        let target = KnowledgeStore::new();
        let loaded = load(&target, &path, &CheckpointSettings::default()).unwrap();
        assert_eq!(loaded.applied, 3);
        assert_eq!(target.get("beta").to_text(), "hello");
    }

    #[test]
    fn save_clears_checkpoint_tracking_not_dissemination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.kb");

        let source = sample_store();
        save(&source, &path, &CheckpointSettings::default()).unwrap();

        // nothing modified since the checkpoint, so the diff is empty
        let saved = save_incremental(&source, &path, &CheckpointSettings::default()).unwrap();
        assert_eq!(saved.records, 0);
        // but the dissemination set still holds the original writes
        assert_eq!(source.modified().len(), 3);
        assert_eq!(source.get("alpha").status, Status::Modified);
    }
}
