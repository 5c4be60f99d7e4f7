// Shared helpers for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ledgerstone::api::{Queue, QueueOptions, RollCycle, SetClock};
use ledgerstone::core::store::{CycleStore, StoreLayout};
use tracing_subscriber::EnvFilter;

pub const HOUR_MS: u64 = 3_600_000;

/// Installs a test-friendly subscriber once; `RUST_LOG` overrides the default `warn`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Small hourly queue with a dense index, driven by `clock`.
pub fn small_options(clock: &SetClock) -> QueueOptions {
    QueueOptions::new()
        .with_roll_cycle(RollCycle::Hourly)
        .with_cycle_capacity(1024 * 1024)
        .with_index_count(64)
        .with_index_spacing(8)
        .with_safe_length(4096)
        .with_lock_timeout(Duration::from_secs(5))
        .with_clock(Arc::new(clock.clone()))
}

/// File of `cycle` in a queue opened with the default epoch.
pub fn cycle_path(dir: &Path, roll: RollCycle, cycle: u32) -> std::path::PathBuf {
    dir.join(roll.file_name(cycle, 0).expect("cycle file name"))
}

pub fn layout_of(queue: &Queue) -> StoreLayout {
    let metadata = queue.metadata();
    StoreLayout {
        capacity: metadata.cycle_capacity,
        index_count: metadata.index_count,
        index_spacing: metadata.index_spacing,
        sequence_bits: metadata.sequence_bits,
    }
}

/// Maps an existing cycle file of `queue` directly, outside the store pool.
pub fn open_cycle(queue: &Queue, cycle: u32) -> CycleStore {
    let path = cycle_path(queue.dir(), queue.roll_cycle(), cycle);
    CycleStore::open(&path, cycle, &layout_of(queue), false)
        .expect("open store")
        .expect("store exists")
}

/// Deterministic payload generator.
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn payload(&mut self, max_len: usize) -> Vec<u8> {
        let len = 1 + (self.next_u64() as usize % max_len);
        (0..len).map(|_| self.next_u64() as u8).collect()
    }
}
