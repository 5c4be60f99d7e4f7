//! Purpose: Map wall-clock time to cycles, cycles to file names, and (cycle, seq) to global indices.
//! Exports: `RollCycle`, `IndexEncoding`, `CYCLE_FILE_SUFFIX`.
//! Role: Pure arithmetic shared by the appender, store pool and directory scans.
//! Invariants: Global index = `(cycle << sequence_bits) | seq`; the encoding never changes for a queue.
//! Invariants: Cycle numbers never decrease as time advances, so global indices are monotonic.
//! Invariants: File names show the cycle's start time (epoch plus whole cycles) and parse back
//! to the same cycle for the same epoch.
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::core::error::{Error, ErrorKind, Result};

pub const CYCLE_FILE_SUFFIX: &str = ".lgs";

const DAY_NAME: &[BorrowedFormatItem<'static>] = format_description!("[year][month][day]");
const SECOND_NAME: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollCycle {
    TestSecondly,
    Minutely,
    Hourly,
    Daily,
}

impl RollCycle {
    pub fn length_millis(self) -> u64 {
        match self {
            RollCycle::TestSecondly => 1_000,
            RollCycle::Minutely => 60_000,
            RollCycle::Hourly => 3_600_000,
            RollCycle::Daily => 86_400_000,
        }
    }

    pub fn default_index_count(self) -> u32 {
        match self {
            RollCycle::TestSecondly => 32,
            RollCycle::Minutely => 2 << 10,
            RollCycle::Hourly => 4 << 10,
            RollCycle::Daily => 8 << 10,
        }
    }

    pub fn default_index_spacing(self) -> u32 {
        match self {
            RollCycle::TestSecondly => 4,
            RollCycle::Minutely | RollCycle::Hourly => 16,
            RollCycle::Daily => 64,
        }
    }

    fn name_format(self) -> &'static [BorrowedFormatItem<'static>] {
        match self {
            RollCycle::Daily => DAY_NAME,
            _ => SECOND_NAME,
        }
    }

    /// Smallest time step a file name can show.
    fn name_resolution_millis(self) -> u64 {
        match self {
            RollCycle::Daily => 86_400_000,
            _ => 1_000,
        }
    }

    /// Cycle containing `now_ms`, counted from `epoch_ms`.
    pub fn cycle_at(self, now_ms: u64, epoch_ms: u64) -> Result<u32> {
        let elapsed = now_ms.checked_sub(epoch_ms).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("time {now_ms} is before the queue epoch {epoch_ms}"))
        })?;
        u32::try_from(elapsed / self.length_millis()).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("cycle number exceeds u32")
                .with_source(err)
        })
    }

    pub fn file_name(self, cycle: u32, epoch_ms: u64) -> Result<String> {
        let start_ms = i128::from(epoch_ms) + i128::from(cycle) * i128::from(self.length_millis());
        let start = OffsetDateTime::from_unix_timestamp_nanos(start_ms * 1_000_000).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("cycle start out of range")
                .with_cycle(cycle)
                .with_source(err)
        })?;
        let stem = start.format(self.name_format()).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to format cycle name")
                .with_cycle(cycle)
                .with_source(err)
        })?;
        Ok(format!("{stem}{CYCLE_FILE_SUFFIX}"))
    }

    /// Inverse of `file_name`; `None` for names this roll cycle and epoch did not produce.
    pub fn parse_file_name(self, name: &str, epoch_ms: u64) -> Option<u32> {
        let stem = name.strip_suffix(CYCLE_FILE_SUFFIX)?;
        let shown = match self {
            RollCycle::Daily => Date::parse(stem, self.name_format()).ok()?.midnight().assume_utc(),
            _ => PrimitiveDateTime::parse(stem, self.name_format()).ok()?.assume_utc(),
        };
        // The name drops the epoch's sub-resolution part; every cycle start shares it.
        let shown_ms = u64::try_from(shown.unix_timestamp()).ok()? * 1_000;
        let start_ms = shown_ms + epoch_ms % self.name_resolution_millis();
        let elapsed = start_ms.checked_sub(epoch_ms)?;
        if elapsed % self.length_millis() != 0 {
            return None;
        }
        u32::try_from(elapsed / self.length_millis()).ok()
    }
}

/// Packs `(cycle, sequence)` into one 64-bit global index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexEncoding {
    sequence_bits: u32,
}

impl IndexEncoding {
    pub fn new(sequence_bits: u32) -> Result<Self> {
        if !(1..=63).contains(&sequence_bits) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("sequence bits {sequence_bits} outside 1..=63")));
        }
        Ok(Self { sequence_bits })
    }

    pub fn sequence_bits(&self) -> u32 {
        self.sequence_bits
    }

    pub fn max_sequence(&self) -> u64 {
        (1u64 << self.sequence_bits) - 1
    }

    pub fn to_index(&self, cycle: u32, sequence: u64) -> Result<u64> {
        if sequence > self.max_sequence() {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message(format!(
                    "sequence exceeds {} bits; cycle is full",
                    self.sequence_bits
                ))
                .with_cycle(cycle)
                .with_seq(sequence));
        }
        let cycle_bits = 64 - self.sequence_bits;
        if cycle_bits < 32 && u64::from(cycle) >> cycle_bits != 0 {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message("cycle does not fit the index encoding")
                .with_cycle(cycle));
        }
        Ok((u64::from(cycle) << self.sequence_bits) | sequence)
    }

    pub fn to_cycle(&self, index: u64) -> Result<u32> {
        u32::try_from(index >> self.sequence_bits).map_err(|err| {
            Error::new(ErrorKind::Bounds)
                .with_message(format!(
                    "index {index} names a cycle beyond u32 with {} sequence bits",
                    self.sequence_bits
                ))
                .with_source(err)
        })
    }

    pub fn to_sequence(&self, index: u64) -> u64 {
        index & self.max_sequence()
    }
}
