//! Purpose: One mapped cycle file (records plus its index) and the registry that shares them.
//! Exports: `CycleStore`, `StoreLayout`, `Recovery`, `StorePool`, `StoreHandle`, `should_evict`.
//! Role: Owns the write position and last sequence of a cycle; repairs crash leftovers under lock.
//! Invariants: Persisted write position always lies in `[data_start, capacity - 4]`.
//! Invariants: The final 4 bytes of a cycle file are reserved for the end-of-cycle marker.
//! Invariants: Only the write-lock holder mutates a store; readers rely on `READY` headers alone.
//! Invariants: A store is evicted only when unreferenced and a newer cycle is active.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::format::{
    LAST_SEQUENCE_OFFSET, PROLOGUE_SIZE, StorePrologue, WRITE_POSITION_OFFSET, data_start,
};
use crate::core::header::{self, HEADER_SIZE, HeaderState};
use crate::core::index::SequenceIndex;
use crate::core::region::MappedRegion;
use crate::core::roll::RollCycle;

/// Geometry shared by every cycle file of a queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreLayout {
    pub capacity: u64,
    pub index_count: u32,
    pub index_spacing: u32,
    pub sequence_bits: u32,
}

impl StoreLayout {
    pub fn validate(&self) -> Result<()> {
        if !self.index_count.is_power_of_two() || !self.index_spacing.is_power_of_two() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("index count and spacing must be powers of two"));
        }
        let minimum = data_start(self.index_count) as u64 + 2 * HEADER_SIZE as u64;
        if self.capacity < minimum {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "cycle capacity {} below minimum {minimum}",
                self.capacity
            )));
        }
        if self.capacity % 8 != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("cycle capacity must be a multiple of 8"));
        }
        Ok(())
    }
}

/// What `CycleStore::recover` had to repair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Recovery {
    /// Committed records found past the persisted write position.
    pub adopted: u64,
    /// Offset of an abandoned `WORKING` header that was rolled back.
    pub rolled_back: Option<usize>,
    pub index_rebuilt: bool,
}

impl Recovery {
    pub fn is_clean(&self) -> bool {
        *self == Recovery::default()
    }
}

pub struct CycleStore {
    cycle: u32,
    path: PathBuf,
    _file: File,
    region: MappedRegion,
    data: MappedRegion,
    prologue: StorePrologue,
    index: SequenceIndex,
    closed: AtomicBool,
}

impl std::fmt::Debug for CycleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleStore")
            .field("cycle", &self.cycle)
            .field("path", &self.path)
            .field("capacity", &self.region.capacity())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl CycleStore {
    /// Opens the file for `cycle`, creating it when allowed. `Ok(None)` when absent.
    pub fn open(path: &Path, cycle: u32, layout: &StoreLayout, create: bool) -> Result<Option<Self>> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if create {
            options.create(true).truncate(false);
        }
        let mut file = match options.open(path) {
            Ok(file) => file,
            Err(err) if !create && err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io(err).with_path(path).with_cycle(cycle)),
        };

        file.lock_exclusive()
            .map_err(|err| Error::io(err).with_path(path))?;
        let prepared = prepare_store_file(&mut file, path, cycle, layout);
        let unlocked = FileExt::unlock(&file).map_err(|err| Error::io(err).with_path(path));
        let prologue = prepared?;
        unlocked?;

        let region = MappedRegion::map(&file, path)?;
        let mut data = region.clone();
        data.set_limit(region.capacity() - HEADER_SIZE)?;
        let index = SequenceIndex::new(
            region.clone(),
            prologue.data_start as usize,
            prologue.index_count,
            prologue.index_spacing,
        );
        let store = Self {
            cycle,
            path: path.to_path_buf(),
            _file: file,
            region,
            data,
            prologue,
            index,
            closed: AtomicBool::new(false),
        };
        store.check_write_position(store.write_position_raw()?)?;
        Ok(Some(store))
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prologue(&self) -> &StorePrologue {
        &self.prologue
    }

    pub fn data_start(&self) -> usize {
        self.prologue.data_start as usize
    }

    /// Whole-file view.
    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    /// Record area view; its limit stops short of the end-of-cycle slot.
    pub fn data(&self) -> &MappedRegion {
        &self.data
    }

    pub fn index(&self) -> &SequenceIndex {
        &self.index
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("cycle store already released")
                .with_cycle(self.cycle));
        }
        Ok(())
    }

    fn write_position_raw(&self) -> Result<usize> {
        Ok(self.region.read_volatile_u64(WRITE_POSITION_OFFSET)? as usize)
    }

    fn check_write_position(&self, position: usize) -> Result<()> {
        if position > self.data.limit() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "write position jumps past the cycle capacity {}",
                    self.region.capacity()
                ))
                .with_path(&self.path)
                .with_cycle(self.cycle)
                .with_offset(position as u64));
        }
        if position < self.data_start() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("write position precedes the data area")
                .with_path(&self.path)
                .with_cycle(self.cycle)
                .with_offset(position as u64));
        }
        Ok(())
    }

    /// Next free byte.
    pub fn write_position(&self) -> Result<usize> {
        self.ensure_open()?;
        let position = self.write_position_raw()?;
        self.check_write_position(position)?;
        Ok(position)
    }

    pub fn set_write_position(&self, position: usize) -> Result<()> {
        self.ensure_open()?;
        self.check_write_position(position)?;
        if position % header::RECORD_ALIGN != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("write position must be record aligned")
                .with_offset(position as u64));
        }
        self.region
            .write_ordered_u64(WRITE_POSITION_OFFSET, position as u64)
    }

    /// Sequence the next data record receives.
    pub fn next_sequence(&self) -> Result<u64> {
        self.ensure_open()?;
        self.region.read_volatile_u64(LAST_SEQUENCE_OFFSET)
    }

    pub fn last_sequence(&self) -> Result<Option<u64>> {
        Ok(self.next_sequence()?.checked_sub(1))
    }

    pub(crate) fn set_last_sequence(&self, sequence: u64) -> Result<()> {
        self.region
            .write_ordered_u64(LAST_SEQUENCE_OFFSET, sequence + 1)
    }

    /// Bytes left for records, header included.
    pub fn remaining(&self) -> Result<usize> {
        Ok(self.data.limit() - self.write_position()?)
    }

    pub fn is_end_of_cycle(&self) -> Result<bool> {
        let position = self.write_position()?;
        Ok(header::is_end_of_cycle(
            self.region.read_volatile_u32(position)?,
        ))
    }

    /// Terminates the cycle at the write position. Returns false if it was already terminated.
    /// Caller must hold the write lock.
    pub fn write_end_of_cycle(&self) -> Result<bool> {
        let position = self.write_position()?;
        if self
            .region
            .compare_and_swap_u32(position, header::NOT_INITIALIZED, header::END_OF_CYCLE)?
        {
            debug!(cycle = self.cycle, position, "wrote end-of-cycle marker");
            return Ok(true);
        }
        let word = self.region.read_volatile_u32(position)?;
        if header::is_end_of_cycle(word) {
            return Ok(false);
        }
        Err(Error::new(ErrorKind::Contention)
            .with_message(format!(
                "cannot end cycle: header at write position is {:?}",
                header::state(word)
            ))
            .with_cycle(self.cycle)
            .with_offset(position as u64))
    }

    /// Appends an 8-byte aligned `META_DATA` record of `len` zeroed bytes and returns its
    /// payload offset. Caller must hold the write lock.
    pub fn allocate_metadata(&self, len: usize) -> Result<usize> {
        let mut position = self.write_position()?;
        if (position + HEADER_SIZE) % 8 != 0 {
            let padding = header::reserve(&self.data, position, HEADER_SIZE, true)?;
            header::commit(&self.data, &padding, 0)?;
            position += HEADER_SIZE;
            self.set_write_position(position)?;
        }
        let reservation = header::reserve(&self.data, position, len, true)?;
        let payload = reservation.payload_offset();
        if let Err(err) = self.data.zero_range(payload, payload + len, true) {
            header::rollback(&self.data, &reservation)?;
            return Err(err);
        }
        header::commit(&self.data, &reservation, len)?;
        self.set_write_position(header::next_record(position, len))?;
        Ok(payload)
    }

    /// Records `sequence` at `offset` in the index, allocating blocks from this store.
    pub fn index_record(&self, sequence: u64, offset: usize) -> Result<bool> {
        self.index
            .record(sequence, offset, &mut |len| self.allocate_metadata(len))
    }

    pub fn lookup(&self, sequence: u64) -> Result<usize> {
        let end = self.write_position()?;
        self.index
            .lookup(sequence, end)
            .map_err(|err| err.with_cycle(self.cycle))
    }

    /// Payload of the data record holding `sequence`.
    pub fn read(&self, sequence: u64) -> Result<&[u8]> {
        let offset = self.lookup(sequence)?;
        let word = self.region.read_volatile_u32(offset)?;
        self.region
            .bytes_at(offset + HEADER_SIZE, header::length(word))
    }

    pub fn sequence_for_position(&self, position: usize) -> Result<u64> {
        self.ensure_open()?;
        self.index
            .linear_scan_by_position(position)
            .map_err(|err| err.with_cycle(self.cycle))
    }

    pub fn rebuild_index(&self) -> Result<u64> {
        let end = self.write_position()?;
        warn!(cycle = self.cycle, path = %self.path.display(), "rebuilding sequence index");
        self.index
            .rebuild(end, &mut |len| self.allocate_metadata(len))
    }

    /// Reconciles the persisted position, last sequence and index with the record stream.
    /// Caller must hold the write lock.
    pub fn recover(&self) -> Result<Recovery> {
        let position = self.write_position()?;
        let word = self.region.read_volatile_u32(position)?;
        let stored_next = self.next_sequence()?;
        let settled = matches!(
            header::state(word),
            HeaderState::NotInitialized | HeaderState::EndOfCycle
        );
        if settled && self.index.high_water()? == stored_next {
            return Ok(Recovery::default());
        }

        let mut recovery = Recovery::default();
        let start_sequence = match self.index.linear_scan_by_position(position) {
            Ok(sequence) => sequence,
            Err(err) if err.kind() == ErrorKind::Corrupt => {
                warn!(cycle = self.cycle, error = %err, "index disagrees with records");
                self.index.rebuild(position, &mut |len| self.allocate_metadata(len))?;
                recovery.index_rebuilt = true;
                self.index.linear_scan_by_position(position)?
            }
            Err(err) => return Err(err),
        };
        let end = self
            .index
            .scan_to_end(position, start_sequence, self.data.limit())?;
        recovery.adopted = end.next_sequence - start_sequence;

        if let Some(abandoned) = header::abandoned_reservation(&self.data, end.position)? {
            let derived = self.index.linear_scan_by_position(end.position)?;
            if derived != end.next_sequence {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "abandoned header at sequence {} but index derives {derived}",
                        end.next_sequence
                    ))
                    .with_path(&self.path)
                    .with_cycle(self.cycle)
                    .with_offset(end.position as u64));
            }
            header::rollback(&self.data, &abandoned)?;
            warn!(
                cycle = self.cycle,
                offset = end.position,
                reserved = abandoned.max_length(),
                "rolled back abandoned reservation"
            );
            recovery.rolled_back = Some(end.position);
        }

        self.region
            .write_ordered_u64(LAST_SEQUENCE_OFFSET, end.next_sequence)?;
        self.set_write_position(end.position)?;

        let high_water = self.index.high_water()?;
        if high_water > end.next_sequence {
            self.rebuild_index()?;
            recovery.index_rebuilt = true;
        } else if high_water < end.next_sequence {
            let mut offset = self.index.lookup(high_water, end.position)?;
            let mut sequence = high_water;
            while offset < end.position {
                let word = self.region.read_volatile_u32(offset)?;
                if header::is_ready_data(word) {
                    self.index_record(sequence, offset)?;
                    sequence += 1;
                }
                offset = header::next_record(offset, header::length(word));
            }
        }

        if recovery.adopted > 0 {
            debug!(
                cycle = self.cycle,
                adopted = recovery.adopted,
                "adopted records committed past the persisted position"
            );
        }
        Ok(recovery)
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }
}

fn prepare_store_file(
    file: &mut File,
    path: &Path,
    cycle: u32,
    layout: &StoreLayout,
) -> Result<StorePrologue> {
    let len = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::io(err).with_path(path))?;
    if len == 0 {
        let prologue = StorePrologue::new(
            cycle,
            layout.index_count,
            layout.index_spacing,
            layout.sequence_bits,
        );
        file.set_len(layout.capacity)
            .map_err(|err| Error::io(err).with_path(path))?;
        let mut buf = [0u8; PROLOGUE_SIZE];
        buf.copy_from_slice(&prologue.encode());
        buf[WRITE_POSITION_OFFSET..WRITE_POSITION_OFFSET + 8]
            .copy_from_slice(&prologue.data_start.to_le_bytes());
        file.seek(SeekFrom::Start(0))
            .map_err(|err| Error::io(err).with_path(path))?;
        file.write_all(&buf)
            .map_err(|err| Error::io(err).with_path(path))?;
        file.flush().map_err(|err| Error::io(err).with_path(path))?;
        debug!(cycle, path = %path.display(), capacity = layout.capacity, "created cycle file");
        return Ok(prologue);
    }

    let mut buf = [0u8; PROLOGUE_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::io(err).with_path(path))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::io(err).with_path(path))?;
    let prologue = StorePrologue::decode(&buf).map_err(|err| err.with_path(path))?;
    prologue
        .validate(len)
        .map_err(|err| err.with_path(path).with_cycle(cycle))?;
    if prologue.cycle != cycle {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("file holds cycle {}", prologue.cycle))
            .with_path(path)
            .with_cycle(cycle));
    }
    debug!(cycle, path = %path.display(), "opened cycle file");
    Ok(prologue)
}

/// Eviction policy: unreferenced stores go once a newer cycle is active.
pub fn should_evict(refs: usize, cycle: u32, active: Option<u32>) -> bool {
    refs == 0 && active.is_some_and(|active| cycle < active)
}

struct Slot {
    store: Arc<CycleStore>,
    refs: usize,
}

#[derive(Default)]
struct Registry {
    slots: BTreeMap<u32, Slot>,
    active: Option<u32>,
}

struct PoolShared {
    dir: PathBuf,
    roll: RollCycle,
    epoch_ms: u64,
    layout: StoreLayout,
    registry: Mutex<Registry>,
    outstanding: AtomicUsize,
}

/// Registry of open cycle stores keyed by cycle, with reference-counted handles.
#[derive(Clone)]
pub struct StorePool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for StorePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePool")
            .field("dir", &self.shared.dir)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl StorePool {
    pub fn new(
        dir: impl Into<PathBuf>,
        roll: RollCycle,
        epoch_ms: u64,
        layout: StoreLayout,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                dir: dir.into(),
                roll,
                epoch_ms,
                layout,
                registry: Mutex::new(Registry::default()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.shared.layout
    }

    pub fn roll(&self) -> RollCycle {
        self.shared.roll
    }

    /// Cycles that have a file in the queue directory, ascending.
    pub fn cycles_on_disk(&self) -> Result<Vec<u32>> {
        let dir = &self.shared.dir;
        let entries = fs::read_dir(dir).map_err(|err| Error::io(err).with_path(dir))?;
        let mut cycles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(err).with_path(dir))?;
            let name = entry.file_name();
            let parsed = name
                .to_str()
                .and_then(|name| self.shared.roll.parse_file_name(name, self.shared.epoch_ms));
            if let Some(cycle) = parsed {
                cycles.push(cycle);
            }
        }
        cycles.sort_unstable();
        Ok(cycles)
    }

    pub fn path_for(&self, cycle: u32) -> Result<PathBuf> {
        let name = self.shared.roll.file_name(cycle, self.shared.epoch_ms)?;
        Ok(self.shared.dir.join(name))
    }

    /// Looks up or opens the store for `cycle`. `Ok(None)` if absent and not created.
    pub fn acquire(&self, cycle: u32, create_if_absent: bool) -> Result<Option<StoreHandle>> {
        let mut registry = self.shared.lock_registry()?;
        if let Some(slot) = registry.slots.get_mut(&cycle) {
            slot.refs += 1;
            let store = Arc::clone(&slot.store);
            return Ok(Some(self.handle(store)));
        }
        let path = self.path_for(cycle)?;
        let Some(store) = CycleStore::open(&path, cycle, &self.shared.layout, create_if_absent)?
        else {
            return Ok(None);
        };
        let store = Arc::new(store);
        registry.slots.insert(
            cycle,
            Slot {
                store: Arc::clone(&store),
                refs: 1,
            },
        );
        Ok(Some(self.handle(store)))
    }

    fn handle(&self, store: Arc<CycleStore>) -> StoreHandle {
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        StoreHandle {
            pool: Arc::clone(&self.shared),
            store,
            released: false,
        }
    }

    /// Marks `cycle` as the newest active cycle and evicts idle older stores.
    pub fn set_active(&self, cycle: u32) -> Result<()> {
        let mut registry = self.shared.lock_registry()?;
        if registry.active.is_some_and(|active| active >= cycle) {
            return Ok(());
        }
        registry.active = Some(cycle);
        evict_idle(&mut registry);
        Ok(())
    }

    pub fn active(&self) -> Result<Option<u32>> {
        Ok(self.shared.lock_registry()?.active)
    }

    /// Handles acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn open_cycles(&self) -> Result<Vec<u32>> {
        Ok(self.shared.lock_registry()?.slots.keys().copied().collect())
    }

    /// Drops every idle store; returns the number of handles still outstanding.
    pub fn close(&self) -> Result<usize> {
        let mut registry = self.shared.lock_registry()?;
        registry.slots.retain(|cycle, slot| {
            if slot.refs > 0 {
                return true;
            }
            slot.store.close();
            debug!(cycle, "closed cycle store");
            false
        });
        Ok(self.outstanding())
    }
}

impl PoolShared {
    fn lock_registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("store registry poisoned")
        })
    }

    fn release(&self, cycle: u32) -> Result<()> {
        let mut registry = self.lock_registry()?;
        let slot = registry.slots.get_mut(&cycle).ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message("released a store missing from the registry")
                .with_cycle(cycle)
        })?;
        slot.refs = slot.refs.saturating_sub(1);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        evict_idle(&mut registry);
        Ok(())
    }
}

fn evict_idle(registry: &mut Registry) {
    let active = registry.active;
    registry.slots.retain(|cycle, slot| {
        if !should_evict(slot.refs, *cycle, active) {
            return true;
        }
        slot.store.close();
        debug!(cycle, ?active, "evicted cycle store");
        false
    });
}

/// Counted reference to an open store. Release explicitly to observe errors; drop releases too.
pub struct StoreHandle {
    pool: Arc<PoolShared>,
    store: Arc<CycleStore>,
    released: bool,
}

impl StoreHandle {
    pub fn store(&self) -> &CycleStore {
        &self.store
    }

    pub fn cycle(&self) -> u32 {
        self.store.cycle()
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.pool.release(self.store.cycle())
    }
}

impl std::ops::Deref for StoreHandle {
    type Target = CycleStore;

    fn deref(&self) -> &CycleStore {
        &self.store
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("cycle", &self.store.cycle())
            .finish()
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.pool.release(self.store.cycle()) {
            warn!(cycle = self.store.cycle(), error = %err, "failed to release store handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CycleStore, StoreLayout, StorePool, should_evict};
    use crate::core::error::ErrorKind;
    use crate::core::header::{self, END_OF_CYCLE, HEADER_SIZE};
    use crate::core::roll::RollCycle;

    fn layout() -> StoreLayout {
        StoreLayout {
            capacity: 64 * 1024,
            index_count: 8,
            index_spacing: 4,
            sequence_bits: 32,
        }
    }

    fn commit_record(store: &CycleStore, sequence: u64, payload: &[u8]) -> usize {
        let position = store.write_position().expect("position");
        let res = header::reserve(store.data(), position, payload.len(), false).expect("reserve");
        store
            .data()
            .write_bytes_at(res.payload_offset(), payload)
            .expect("payload");
        header::commit(store.data(), &res, payload.len()).expect("commit");
        store.set_last_sequence(sequence).expect("last");
        store
            .set_write_position(header::next_record(position, payload.len()))
            .expect("advance");
        store.index_record(sequence, position).expect("index");
        position
    }

    #[test]
    fn eviction_requires_idle_and_newer_active() {
        assert!(should_evict(0, 3, Some(4)));
        assert!(!should_evict(1, 3, Some(4)));
        assert!(!should_evict(0, 4, Some(4)));
        assert!(!should_evict(0, 3, None));
    }

    #[test]
    fn fresh_store_starts_at_data_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.lgs");
        let store = CycleStore::open(&path, 5, &layout(), true)
            .expect("open")
            .expect("created");
        assert_eq!(store.write_position().expect("pos"), store.data_start());
        assert_eq!(store.last_sequence().expect("last"), None);
        assert_eq!(store.prologue().cycle, 5);

        assert!(
            CycleStore::open(&dir.path().join("missing.lgs"), 6, &layout(), false)
                .expect("lock state")
                .is_none()
        );
    }

    #[test]
    fn reopen_restores_position_and_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.lgs");
        let offsets: Vec<usize> = {
            let store = CycleStore::open(&path, 1, &layout(), true)
                .expect("open")
                .expect("store");
            (0..10u64)
                .map(|seq| commit_record(&store, seq, format!("record-{seq}").as_bytes()))
                .collect()
        };

        let store = CycleStore::open(&path, 1, &layout(), false)
            .expect("reopen")
            .expect("store");
        assert_eq!(store.last_sequence().expect("last"), Some(9));
        assert!(store.recover().expect("recover").is_clean());
        for (seq, offset) in offsets.iter().enumerate() {
            assert_eq!(store.lookup(seq as u64).expect("lookup"), *offset);
        }
        assert_eq!(store.read(3).expect("read"), b"record-3");
        let err = CycleStore::open(&path, 2, &layout(), false).expect_err("wrong cycle");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn recover_adopts_commit_past_position_and_rolls_back_working() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.lgs");
        let store = CycleStore::open(&path, 1, &layout(), true)
            .expect("open")
            .expect("store");
        for seq in 0..5u64 {
            commit_record(&store, seq, b"payload");
        }
        // Committed but never published, then a reservation that was abandoned.
        let position = store.write_position().expect("pos");
        let orphan = header::reserve(store.data(), position, 7, false).expect("reserve");
        header::commit(store.data(), &orphan, 7).expect("commit");
        let next = header::next_record(position, 7);
        header::reserve(store.data(), next, 32, false).expect("abandoned");

        let recovery = store.recover().expect("recover");
        assert_eq!(recovery.adopted, 1);
        assert_eq!(recovery.rolled_back, Some(next));
        assert_eq!(store.write_position().expect("pos"), next);
        assert_eq!(store.last_sequence().expect("last"), Some(5));
        assert_eq!(store.lookup(5).expect("lookup"), position);
        assert!(header::is_not_initialized(
            store.region().read_volatile_u32(next).expect("word")
        ));
        assert!(store.recover().expect("again").is_clean());
    }

    #[test]
    fn end_of_cycle_is_idempotent_and_blocks_reservations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.lgs");
        let store = CycleStore::open(&path, 1, &layout(), true)
            .expect("open")
            .expect("store");
        commit_record(&store, 0, b"last");
        assert!(store.write_end_of_cycle().expect("eoc"));
        assert!(!store.write_end_of_cycle().expect("again"));
        assert!(store.is_end_of_cycle().expect("lock state"));

        let position = store.write_position().expect("pos");
        assert_eq!(
            store.region().read_volatile_u32(position).expect("word"),
            END_OF_CYCLE
        );
        let err = header::reserve(store.data(), position, 4, false).expect_err("ended");
        assert_eq!(err.kind(), ErrorKind::Contention);
    }

    #[test]
    fn end_of_cycle_fits_in_a_full_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.lgs");
        let small = StoreLayout {
            capacity: 1024,
            ..layout()
        };
        let store = CycleStore::open(&path, 1, &small, true)
            .expect("open")
            .expect("store");
        let position = store.write_position().expect("pos");
        let fill = store.data().limit() - position - HEADER_SIZE;
        commit_record(&store, 0, &vec![1u8; fill]);
        assert_eq!(store.remaining().expect("remaining"), 0);
        assert!(store.write_end_of_cycle().expect("eoc"));
    }

    #[test]
    fn corrupt_write_position_is_rejected_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.lgs");
        {
            let store = CycleStore::open(&path, 1, &layout(), true)
                .expect("open")
                .expect("store");
            store
                .region()
                .write_ordered_u64(super::WRITE_POSITION_OFFSET, 1 << 40)
                .expect("clobber");
        }
        let err = CycleStore::open(&path, 1, &layout(), false).expect_err("jump");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn pool_shares_and_evicts_stores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = StorePool::new(dir.path(), RollCycle::Daily, 0, layout());

        let first = pool.acquire(10, true).expect("acquire").expect("store");
        let again = pool.acquire(10, false).expect("acquire").expect("store");
        assert_eq!(pool.outstanding(), 2);
        assert!(pool.acquire(11, false).expect("lock state").is_none());
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("foreign file");
        assert_eq!(pool.cycles_on_disk().expect("cycles"), vec![10]);

        pool.set_active(11).expect("active");
        assert_eq!(pool.open_cycles().expect("cycles"), vec![10]);
        first.release().expect("release");
        assert_eq!(pool.open_cycles().expect("cycles"), vec![10]);
        drop(again);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.open_cycles().expect("cycles").is_empty());
    }

    #[test]
    fn evicted_store_reports_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = StorePool::new(dir.path(), RollCycle::Daily, 0, layout());
        let handle = pool.acquire(3, true).expect("acquire").expect("store");
        let store = std::sync::Arc::clone(&handle.store);
        handle.release().expect("release");
        pool.set_active(4).expect("active");

        let err = store.write_position().expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(pool.close().expect("close"), 0);
    }
}
