//! Purpose: Sparse two-level index from per-cycle sequence number to record offset.
//! Exports: `SequenceIndex`, `BlockAllocator`.
//! Role: Makes random access by sequence cheap; falls back to a linear scan between entries.
//! Invariants: Slot `k` holds the offset of sequence `k * spacing`; any populated slot <= target is
//! a valid scan start, so a hole left by a crash only costs scan length.
//! Invariants: An entry is published only after its record header is `READY`.
//! Invariants: `record` accepts strictly increasing sequences; the high-water mark is published last.
//! Invariants: Level-2 blocks are `META_DATA` records inside the data area, 8-byte aligned.
use tracing::debug;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::format::{INDEX_ARRAY_OFFSET, INDEX_HIGH_WATER_OFFSET};
use crate::core::header::{self, HeaderState};
use crate::core::region::MappedRegion;

/// Supplies zeroed, 8-byte aligned space for a level-2 block and returns its offset.
pub type BlockAllocator<'a> = dyn FnMut(usize) -> Result<usize> + 'a;

#[derive(Clone, Debug)]
pub struct SequenceIndex {
    region: MappedRegion,
    data_start: usize,
    index_count: usize,
    spacing: u64,
}

/// Where a scan stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanEnd {
    /// First offset that does not hold a complete record.
    pub position: usize,
    /// Sequence the next data record would receive.
    pub next_sequence: u64,
}

impl SequenceIndex {
    pub fn new(region: MappedRegion, data_start: usize, index_count: u32, spacing: u32) -> Self {
        Self {
            region,
            data_start,
            index_count: index_count as usize,
            spacing: u64::from(spacing),
        }
    }

    pub fn spacing(&self) -> u64 {
        self.spacing
    }

    fn max_slots(&self) -> u64 {
        (self.index_count * self.index_count) as u64
    }

    /// `seq + 1` of the last recorded sequence, 0 when nothing was recorded.
    pub fn high_water(&self) -> Result<u64> {
        self.region.read_volatile_u64(INDEX_HIGH_WATER_OFFSET)
    }

    fn block(&self, l1: usize) -> Result<usize> {
        Ok(self
            .region
            .read_volatile_u64(INDEX_ARRAY_OFFSET + l1 * 8)? as usize)
    }

    fn entry(&self, slot: u64) -> Result<usize> {
        if slot >= self.max_slots() {
            return Ok(0);
        }
        let slot = slot as usize;
        let block = self.block(slot / self.index_count)?;
        if block == 0 {
            return Ok(0);
        }
        Ok(self
            .region
            .read_volatile_u64(block + (slot % self.index_count) * 8)? as usize)
    }

    /// Records `offset` for `sequence`; returns whether a sparse entry was written.
    pub fn record(
        &self,
        sequence: u64,
        offset: usize,
        allocate: &mut BlockAllocator<'_>,
    ) -> Result<bool> {
        let high_water = self.high_water()?;
        if sequence < high_water {
            return Err(Error::new(ErrorKind::OrderingViolation)
                .with_message(format!(
                    "index already holds sequence {}",
                    high_water - 1
                ))
                .with_seq(sequence)
                .with_offset(offset as u64));
        }
        let recorded = self.publish_entry(sequence, offset, allocate)?;
        self.region
            .write_ordered_u64(INDEX_HIGH_WATER_OFFSET, sequence + 1)?;
        Ok(recorded)
    }

    fn publish_entry(
        &self,
        sequence: u64,
        offset: usize,
        allocate: &mut BlockAllocator<'_>,
    ) -> Result<bool> {
        if sequence % self.spacing != 0 {
            return Ok(false);
        }
        let slot = sequence / self.spacing;
        if slot >= self.max_slots() {
            debug!(sequence, "index capacity exhausted; lookups fall back to scanning");
            return Ok(false);
        }
        let slot = slot as usize;
        let l1_offset = INDEX_ARRAY_OFFSET + (slot / self.index_count) * 8;
        let mut block = self.region.read_volatile_u64(l1_offset)? as usize;
        if block == 0 {
            block = match allocate(self.index_count * 8) {
                Ok(block) => block,
                Err(err) if err.kind() == ErrorKind::Bounds => {
                    debug!(sequence, "no room for an index block; entry skipped");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };
            debug!(sequence, block, "allocated index block");
            self.region.write_ordered_u64(l1_offset, block as u64)?;
        }
        self.region
            .write_ordered_u64(block + (slot % self.index_count) * 8, offset as u64)?;
        Ok(true)
    }

    /// Marks every sequence below `next` as recorded without touching entries.
    /// Used after bulk writes whose only indexable record was recorded explicitly.
    pub fn skip_to(&self, next: u64) -> Result<()> {
        let high_water = self.high_water()?;
        if next < high_water {
            return Err(Error::new(ErrorKind::OrderingViolation)
                .with_message(format!("index already holds sequence {}", high_water - 1))
                .with_seq(next));
        }
        let first_skipped = high_water.div_ceil(self.spacing) * self.spacing;
        if first_skipped < next && first_skipped / self.spacing < self.max_slots() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("skipping would leave an indexable sequence unrecorded")
                .with_seq(first_skipped));
        }
        self.region.write_ordered_u64(INDEX_HIGH_WATER_OFFSET, next)
    }

    /// Greatest populated slot `<= upper` whose entry satisfies `accept`, via binary search
    /// over the populated prefix.
    fn last_slot(&self, upper: u64, accept: impl Fn(usize) -> bool) -> Result<Option<(u64, usize)>> {
        let upper = upper.min(self.max_slots().saturating_sub(1));
        let mut lo = 0u64;
        let mut hi = upper + 1;
        let mut found = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry(mid)?;
            if entry != 0 && accept(entry) {
                found = Some((mid, entry));
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(found)
    }

    fn start_for_sequence(&self, sequence: u64) -> Result<(usize, u64)> {
        let found = self.last_slot(sequence / self.spacing, |_| true)?;
        Ok(found.map_or((self.data_start, 0), |(slot, offset)| {
            (offset, slot * self.spacing)
        }))
    }

    fn start_for_position(&self, position: usize) -> Result<(usize, u64)> {
        let found = self.last_slot(u64::MAX, |offset| offset <= position)?;
        Ok(found.map_or((self.data_start, 0), |(slot, offset)| {
            (offset, slot * self.spacing)
        }))
    }

    /// Offset of the `READY` header holding `sequence`.
    pub fn lookup(&self, sequence: u64, end: usize) -> Result<usize> {
        let (mut position, mut current) = self.start_for_sequence(sequence)?;
        while position < end {
            let word = self.region.read_volatile_u32(position)?;
            match header::state(word) {
                HeaderState::Ready => {
                    if current == sequence {
                        return Ok(position);
                    }
                    current += 1;
                }
                HeaderState::MetaData => {}
                HeaderState::NotInitialized | HeaderState::Working | HeaderState::EndOfCycle => {
                    break;
                }
            }
            position = header::next_record(position, header::length(word));
        }
        Err(Error::new(ErrorKind::NotFound)
            .with_message("sequence not written")
            .with_seq(sequence))
    }

    /// Sequence of the record at `position`; for the first free offset, the next sequence.
    pub fn linear_scan_by_position(&self, position: usize) -> Result<u64> {
        if position < self.data_start {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message("position precedes the data area")
                .with_offset(position as u64));
        }
        let (mut offset, mut sequence) = self.start_for_position(position)?;
        while offset < position {
            let word = self.region.read_volatile_u32(offset)?;
            match header::state(word) {
                HeaderState::Ready => sequence += 1,
                HeaderState::MetaData => {}
                HeaderState::NotInitialized | HeaderState::Working | HeaderState::EndOfCycle => {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_message(format!(
                            "scan hit {:?} before reaching position",
                            header::state(word)
                        ))
                        .with_offset(offset as u64));
                }
            }
            offset = header::next_record(offset, header::length(word));
        }
        if offset != position {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("position is not a record boundary")
                .with_offset(position as u64));
        }
        Ok(sequence)
    }

    /// Walks complete records from `from` (holding `sequence`) until the first incomplete header.
    pub fn scan_to_end(&self, from: usize, sequence: u64, limit: usize) -> Result<ScanEnd> {
        let mut position = from;
        let mut next_sequence = sequence;
        while position + header::HEADER_SIZE <= limit {
            let word = self.region.read_volatile_u32(position)?;
            if !header::is_ready(word) {
                break;
            }
            let next = header::next_record(position, header::length(word));
            if next > limit {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("record length runs past the data area")
                    .with_offset(position as u64));
            }
            if header::is_ready_data(word) {
                next_sequence += 1;
            }
            position = next;
        }
        Ok(ScanEnd {
            position,
            next_sequence,
        })
    }

    /// Cross-checks every populated entry against the headers and the slot it claims.
    pub fn verify(&self) -> Result<()> {
        let mut previous = 0usize;
        let mut last = None;
        for slot in 0..self.max_slots() {
            let entry = self.entry(slot)?;
            if entry == 0 {
                break;
            }
            if entry <= previous || entry < self.data_start {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("index entries are not increasing")
                    .with_seq(slot * self.spacing)
                    .with_offset(entry as u64));
            }
            if !header::is_ready_data(self.region.read_volatile_u32(entry)?) {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("index entry does not point at a ready record")
                    .with_seq(slot * self.spacing)
                    .with_offset(entry as u64));
            }
            previous = entry;
            last = Some((slot, entry));
        }
        if let Some((slot, entry)) = last {
            let expected = slot * self.spacing;
            let scanned = self.scan_between(self.data_start, 0, entry)?;
            if scanned != expected {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "index claims sequence {expected} but scan found {scanned}"
                    ))
                    .with_offset(entry as u64));
            }
        }
        Ok(())
    }

    fn scan_between(&self, from: usize, sequence: u64, to: usize) -> Result<u64> {
        let mut position = from;
        let mut sequence = sequence;
        while position < to {
            let word = self.region.read_volatile_u32(position)?;
            if !header::is_ready(word) {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("incomplete record inside committed range")
                    .with_offset(position as u64));
            }
            if header::is_ready_data(word) {
                sequence += 1;
            }
            position = header::next_record(position, header::length(word));
        }
        Ok(sequence)
    }

    /// Discards every entry and re-records the committed records in `[data_start, end)`.
    pub fn rebuild(&self, end: usize, allocate: &mut BlockAllocator<'_>) -> Result<u64> {
        let block_len = self.index_count * 8;
        for l1 in 0..self.index_count {
            let block = self.block(l1)?;
            if block == 0 {
                continue;
            }
            let reusable = block % 8 == 0
                && block >= self.data_start + header::HEADER_SIZE
                && block + block_len <= self.region.capacity()
                && self.region.read_volatile_u32(block - header::HEADER_SIZE)?
                    == header::ready_word(block_len, true);
            if reusable {
                self.region.zero_range(block, block + block_len, true)?;
            } else {
                self.region
                    .write_ordered_u64(INDEX_ARRAY_OFFSET + l1 * 8, 0)?;
            }
        }
        self.region.write_ordered_u64(INDEX_HIGH_WATER_OFFSET, 0)?;

        let mut position = self.data_start;
        let mut sequence = 0u64;
        while position < end {
            let word = self.region.read_volatile_u32(position)?;
            if !header::is_ready(word) {
                break;
            }
            if header::is_ready_data(word) {
                self.record(sequence, position, allocate)?;
                sequence += 1;
            }
            position = header::next_record(position, header::length(word));
        }
        Ok(sequence)
    }
}
