// Cycle-store consistency checks plus debug-only assertions.
// Full scans are for explicit verification; hot paths cross-check a single record.
// Snapshot output is opt-in and written to .scratch/ on failure.
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::header::{self, HEADER_SIZE, HeaderState};
use crate::core::store::CycleStore;

const SNAPSHOT_DIR: &str = ".scratch";
const SNAPSHOT_PREFIX: &str = "store-snapshot-";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotMode {
    Disabled,
    OnFailure,
}

/// Shape of the record stream from `data_start` to the first incomplete header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StreamScan {
    pub data_records: u64,
    pub metadata_records: u64,
    /// First offset without a complete record.
    pub end: usize,
    /// Header state found at `end`.
    pub end_state: Option<HeaderState>,
}

impl StreamScan {
    pub fn last_sequence(&self) -> Option<u64> {
        self.data_records.checked_sub(1)
    }
}

/// Walks every complete record; fails on a length that runs past the data area.
/// On failure the partial scan is returned alongside the error.
pub fn scan_stream(store: &CycleStore) -> std::result::Result<StreamScan, (StreamScan, Error)> {
    let data = store.data();
    let limit = data.limit();
    let mut scan = StreamScan {
        end: store.data_start(),
        ..StreamScan::default()
    };
    while scan.end + HEADER_SIZE <= limit {
        let word = match data.read_volatile_u32(scan.end) {
            Ok(word) => word,
            Err(err) => return Err((scan, err)),
        };
        let state = header::state(word);
        if !matches!(state, HeaderState::Ready | HeaderState::MetaData) {
            scan.end_state = Some(state);
            return Ok(scan);
        }
        let next = header::next_record(scan.end, header::length(word));
        if next > limit {
            let err = Error::new(ErrorKind::Corrupt)
                .with_message("record length runs past the data area")
                .with_offset(scan.end as u64);
            return Err((scan, err));
        }
        if state == HeaderState::Ready {
            scan.data_records += 1;
        } else {
            scan.metadata_records += 1;
        }
        scan.end = next;
    }
    if let Ok(word) = store.region().read_volatile_u32(scan.end) {
        scan.end_state = Some(header::state(word));
    }
    Ok(scan)
}

/// Full consistency check of one cycle: record stream, persisted markers, and index.
/// Expects a quiescent store (write lock held or no writers).
pub fn validate_store_state(store: &CycleStore) -> Result<()> {
    let scan = scan_stream(store).map_err(|(_, err)| err.with_cycle(store.cycle()))?;
    if scan.end_state == Some(HeaderState::Working) {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("reservation left in progress")
            .with_cycle(store.cycle())
            .with_offset(scan.end as u64));
    }
    let position = store.write_position()?;
    if position != scan.end {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!(
                "write position {position} but records end at {}",
                scan.end
            ))
            .with_cycle(store.cycle())
            .with_offset(position as u64));
    }
    let next = store.next_sequence()?;
    if next != scan.data_records {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!(
                "last sequence marker says {next} records but scan found {}",
                scan.data_records
            ))
            .with_cycle(store.cycle()));
    }
    store
        .index()
        .verify()
        .map_err(|err| err.with_cycle(store.cycle()))
}

pub fn debug_assert_store_state(store: &CycleStore) {
    debug_assert_store_state_with_snapshot(store, SnapshotMode::Disabled);
}

pub fn debug_assert_store_state_with_snapshot(store: &CycleStore, snapshot: SnapshotMode) {
    if !cfg!(debug_assertions) {
        return;
    }
    if let Err(err) = validate_store_state(store) {
        let snapshot_path = if snapshot == SnapshotMode::OnFailure {
            write_snapshot(store)
        } else {
            None
        };
        if let Some(path) = snapshot_path {
            panic!("cycle store invariant failed: {err} (snapshot: {})", path.display());
        }
        panic!("cycle store invariant failed: {err}");
    }
}

fn write_snapshot(store: &CycleStore) -> Option<PathBuf> {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_millis();
    let dir = Path::new(SNAPSHOT_DIR);
    fs::create_dir_all(dir).ok()?;
    let filename = format!("{SNAPSHOT_PREFIX}{timestamp}-{}.txt", std::process::id());
    let path = dir.join(filename);
    let mut file = File::create(&path).ok()?;

    let prologue = store.prologue();
    let _ = writeln!(file, "timestamp_ms={timestamp}");
    let _ = writeln!(
        file,
        "store path={} cycle={} index_count={} index_spacing={} data_start={}",
        store.path().display(),
        prologue.cycle,
        prologue.index_count,
        prologue.index_spacing,
        store.data_start()
    );
    let _ = writeln!(
        file,
        "markers write_position={:?} next_sequence={:?} index_high_water={:?}",
        store.write_position().ok(),
        store.next_sequence().ok(),
        store.index().high_water().ok()
    );
    match scan_stream(store) {
        Ok(scan) => {
            let _ = writeln!(file, "scan {scan:?}");
        }
        Err((scan, err)) => {
            let _ = writeln!(file, "scan {scan:?} error={err}");
        }
    }
    if let Ok(position) = store.write_position() {
        let _ = write_header_snapshot(&mut file, "at_position", store, position);
    }
    Some(path)
}

fn write_header_snapshot(
    file: &mut File,
    label: &str,
    store: &CycleStore,
    offset: usize,
) -> std::io::Result<()> {
    match store.region().read_volatile_u32(offset) {
        Ok(word) => writeln!(
            file,
            "{label}: offset={offset} word={word:#010x} state={:?} length={}",
            header::state(word),
            header::length(word)
        ),
        Err(err) => writeln!(file, "{label}: offset={offset} read_error={err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        SNAPSHOT_PREFIX, SnapshotMode, debug_assert_store_state_with_snapshot, scan_stream,
        validate_store_state,
    };
    use crate::core::error::ErrorKind;
    use crate::core::header::{self, HeaderState};
    use crate::core::store::{CycleStore, StoreLayout};
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;

    fn layout() -> StoreLayout {
        StoreLayout {
            capacity: 64 * 1024,
            index_count: 8,
            index_spacing: 4,
            sequence_bits: 32,
        }
    }

    fn store_with(dir: &Path, payloads: &[&[u8]]) -> CycleStore {
        let store = CycleStore::open(&dir.join("c.lgs"), 0, &layout(), true)
            .expect("open")
            .expect("store");
        for payload in payloads {
            let position = store.write_position().expect("position");
            let reservation =
                header::reserve(store.data(), position, payload.len(), false).expect("reserve");
            store
                .data()
                .write_bytes_at(reservation.payload_offset(), payload)
                .expect("payload");
            header::commit(store.data(), &reservation, payload.len()).expect("commit");
            let sequence = store.next_sequence().expect("next");
            store.set_last_sequence(sequence).expect("last");
            store
                .set_write_position(header::next_record(position, payload.len()))
                .expect("advance");
            store.index_record(sequence, position).expect("index");
        }
        store
    }

    fn snapshot_set() -> HashSet<String> {
        let Ok(entries) = fs::read_dir(Path::new(super::SNAPSHOT_DIR)) else {
            return HashSet::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(SNAPSHOT_PREFIX))
            .collect()
    }

    #[test]
    fn consistent_store_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with(dir.path(), &[b"one", b"two", b"three", b"four", b"five"]);
        let scan = scan_stream(&store).expect("scan");
        assert_eq!(scan.data_records, 5);
        assert_eq!(scan.last_sequence(), Some(4));
        assert_eq!(scan.end_state, Some(HeaderState::NotInitialized));
        validate_store_state(&store).expect("valid");
    }

    #[test]
    fn stale_sequence_marker_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with(dir.path(), &[b"a", b"b"]);
        store.set_last_sequence(0).expect("rewind");
        let err = validate_store_state(&store).expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.cycle(), Some(0));
    }

    #[test]
    fn in_progress_reservation_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with(dir.path(), &[b"a"]);
        let position = store.write_position().expect("position");
        header::reserve(store.data(), position, 16, false).expect("reserve");
        let err = validate_store_state(&store).expect_err("working");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.offset(), Some(position as u64));
    }

    #[test]
    fn snapshot_written_on_validation_failure() {
        if !cfg!(debug_assertions) {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with(dir.path(), &[b"a", b"b"]);
        store
            .set_write_position(store.data_start())
            .expect("rewind");
        let before = snapshot_set();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            debug_assert_store_state_with_snapshot(&store, SnapshotMode::OnFailure);
        }));
        assert!(result.is_err());
        let after = snapshot_set();
        let new_files: Vec<_> = after.difference(&before).cloned().collect();
        assert!(!new_files.is_empty());
        for name in new_files {
            let _ = fs::remove_file(Path::new(super::SNAPSHOT_DIR).join(name));
        }
    }
}
