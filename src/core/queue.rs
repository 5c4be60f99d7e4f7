//! Purpose: Queue directory handle: configuration, persisted metadata, stores, lock, appenders.
//! Exports: `Queue`, `QueueOptions`, `QueueMetadata`, `METADATA_FILE_NAME`.
//! Role: Entry point that wires the store pool, write lock and clock together.
//! Invariants: Roll cycle, epoch, sequence bits and index geometry are fixed at creation;
//! reopening with different options keeps the persisted values.
//! Invariants: `close` fails if any store handle is still outstanding.
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::api::ValidationReport;
use crate::api::validation::validate_store_report;
use crate::core::appender::{Appender, AppenderSettings};
use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::format::FORMAT_VERSION;
use crate::core::lock::{MAX_HOLDER, WriteLock};
use crate::core::roll::{IndexEncoding, RollCycle};
use crate::core::store::{StoreLayout, StorePool};

pub const METADATA_FILE_NAME: &str = "metadata.json";

const DEFAULT_CYCLE_CAPACITY: u64 = 64 * 1024 * 1024;
const DEFAULT_SAFE_LENGTH: usize = 128 * 1024;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STALE_LOCK: Duration = Duration::from_secs(30);
const DEFAULT_PRETOUCH_AHEAD: usize = 256 * 1024;
const DEFAULT_SEQUENCE_BITS: u32 = 32;

#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub roll_cycle: RollCycle,
    pub epoch_ms: u64,
    pub cycle_capacity: u64,
    pub sequence_bits: u32,
    /// Defaults to the roll cycle's preset.
    pub index_count: Option<u32>,
    pub index_spacing: Option<u32>,
    /// Extra payload space reserved with each header so a following reservation never
    /// overlaps an in-flight record.
    pub safe_length: usize,
    pub lock_timeout: Duration,
    pub stale_lock_threshold: Duration,
    pub double_buffer: bool,
    pub pretouch_ahead: usize,
    pub check_index: bool,
    pub clock: Arc<dyn Clock>,
    /// Write-lock holder id; random when unset.
    pub source_id: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueOptions {
    pub fn new() -> Self {
        Self {
            roll_cycle: RollCycle::Daily,
            epoch_ms: 0,
            cycle_capacity: DEFAULT_CYCLE_CAPACITY,
            sequence_bits: DEFAULT_SEQUENCE_BITS,
            index_count: None,
            index_spacing: None,
            safe_length: DEFAULT_SAFE_LENGTH,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_lock_threshold: DEFAULT_STALE_LOCK,
            double_buffer: false,
            pretouch_ahead: DEFAULT_PRETOUCH_AHEAD,
            check_index: false,
            clock: Arc::new(SystemClock),
            source_id: None,
        }
    }

    pub fn with_roll_cycle(mut self, roll_cycle: RollCycle) -> Self {
        self.roll_cycle = roll_cycle;
        self
    }

    pub fn with_epoch_ms(mut self, epoch_ms: u64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    pub fn with_cycle_capacity(mut self, bytes: u64) -> Self {
        self.cycle_capacity = bytes;
        self
    }

    pub fn with_sequence_bits(mut self, bits: u32) -> Self {
        self.sequence_bits = bits;
        self
    }

    pub fn with_index_count(mut self, count: u32) -> Self {
        self.index_count = Some(count);
        self
    }

    pub fn with_index_spacing(mut self, spacing: u32) -> Self {
        self.index_spacing = Some(spacing);
        self
    }

    pub fn with_safe_length(mut self, bytes: usize) -> Self {
        self.safe_length = bytes;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_threshold(mut self, threshold: Duration) -> Self {
        self.stale_lock_threshold = threshold;
        self
    }

    pub fn with_double_buffer(mut self, enabled: bool) -> Self {
        self.double_buffer = enabled;
        self
    }

    pub fn with_pretouch_ahead(mut self, bytes: usize) -> Self {
        self.pretouch_ahead = bytes;
        self
    }

    pub fn with_check_index(mut self, enabled: bool) -> Self {
        self.check_index = enabled;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_source_id(mut self, source_id: u32) -> Self {
        self.source_id = Some(source_id);
        self
    }

    fn metadata(&self) -> QueueMetadata {
        QueueMetadata {
            format_version: FORMAT_VERSION,
            roll_cycle: self.roll_cycle,
            epoch_ms: self.epoch_ms,
            sequence_bits: self.sequence_bits,
            index_count: self
                .index_count
                .unwrap_or_else(|| self.roll_cycle.default_index_count()),
            index_spacing: self
                .index_spacing
                .unwrap_or_else(|| self.roll_cycle.default_index_spacing()),
            cycle_capacity: self.cycle_capacity,
        }
    }
}

/// Queue-wide configuration persisted as `metadata.json`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadata {
    pub format_version: u32,
    pub roll_cycle: RollCycle,
    pub epoch_ms: u64,
    pub sequence_bits: u32,
    pub index_count: u32,
    pub index_spacing: u32,
    pub cycle_capacity: u64,
}

impl QueueMetadata {
    fn layout(&self) -> StoreLayout {
        StoreLayout {
            capacity: self.cycle_capacity,
            index_count: self.index_count,
            index_spacing: self.index_spacing,
            sequence_bits: self.sequence_bits,
        }
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io(err).with_path(path)),
        };
        let metadata: QueueMetadata = serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("unreadable queue metadata")
                .with_path(path)
                .with_source(err)
        })?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(crate::core::format::format_version_error(metadata.format_version)
                .with_path(path));
        }
        Ok(Some(metadata))
    }

    /// Publishes `self` unless another process got there first; returns the winning metadata.
    fn create(&self, dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE_NAME);
        let staging = dir.join(format!(".{METADATA_FILE_NAME}.{}", std::process::id()));
        let text = serde_json::to_string_pretty(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode queue metadata")
                .with_source(err)
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&staging)
            .map_err(|err| Error::io(err).with_path(&staging))?;
        file.write_all(text.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|err| Error::io(err).with_path(&staging))?;
        drop(file);

        let linked = fs::hard_link(&staging, &path);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => {
                debug!(path = %path.display(), "created queue metadata");
                Ok(self.clone())
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Self::load(&path)?
                .ok_or_else(|| {
                    Error::new(ErrorKind::Internal)
                        .with_message("queue metadata vanished after creation race")
                        .with_path(&path)
                }),
            Err(err) => Err(Error::io(err).with_path(&path)),
        }
    }
}

pub struct Queue {
    dir: PathBuf,
    metadata: QueueMetadata,
    options: QueueOptions,
    encoding: IndexEncoding,
    pool: StorePool,
    lock: WriteLock,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("dir", &self.dir)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Queue {
    /// Opens the queue in `dir`, creating the directory and metadata on first use.
    pub fn open(dir: impl AsRef<Path>, options: QueueOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| Error::io(err).with_path(&dir))?;

        let requested = options.metadata();
        requested.layout().validate()?;
        let metadata = match QueueMetadata::load(&dir.join(METADATA_FILE_NAME))? {
            Some(existing) => existing,
            None => requested.create(&dir)?,
        };
        if metadata != requested {
            info!(
                dir = %dir.display(),
                persisted = ?metadata,
                "queue exists; persisted configuration overrides options"
            );
        }
        metadata.layout().validate()?;
        let encoding = IndexEncoding::new(metadata.sequence_bits)?;
        if options.safe_length == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("safe length must be positive"));
        }

        let pool = StorePool::new(
            &dir,
            metadata.roll_cycle,
            metadata.epoch_ms,
            metadata.layout(),
        );
        let lock = WriteLock::open(&dir, Arc::clone(&options.clock), options.stale_lock_threshold)?;
        Ok(Self {
            dir,
            metadata,
            options,
            encoding,
            pool,
            lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &QueueMetadata {
        &self.metadata
    }

    pub fn encoding(&self) -> IndexEncoding {
        self.encoding
    }

    pub fn roll_cycle(&self) -> RollCycle {
        self.metadata.roll_cycle
    }

    /// Cycle the clock currently points at.
    pub fn cycle(&self) -> Result<u32> {
        self.metadata
            .roll_cycle
            .cycle_at(self.options.clock.now_millis(), self.metadata.epoch_ms)
    }

    pub fn first_cycle(&self) -> Result<Option<u32>> {
        Ok(self.pool.cycles_on_disk()?.first().copied())
    }

    pub fn last_cycle(&self) -> Result<Option<u32>> {
        Ok(self.pool.cycles_on_disk()?.last().copied())
    }

    pub fn lock_held(&self) -> Result<bool> {
        self.lock.locked()
    }

    pub fn outstanding_handles(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn acquire_appender(&self) -> Result<Appender> {
        let holder = match self.options.source_id {
            Some(id) if (1..=MAX_HOLDER).contains(&id) => id,
            Some(id) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("source id {id} outside 1..={MAX_HOLDER}")));
            }
            None => random_holder()?,
        };
        let settings = AppenderSettings {
            roll: self.metadata.roll_cycle,
            epoch_ms: self.metadata.epoch_ms,
            encoding: self.encoding,
            clock: Arc::clone(&self.options.clock),
            holder,
            lock_timeout: self.options.lock_timeout,
            safe_length: self.options.safe_length,
            double_buffer: self.options.double_buffer,
            check_index: self.options.check_index,
            pretouch_ahead: self.options.pretouch_ahead,
        };
        Appender::new(self.pool.clone(), self.lock.clone(), settings)
    }

    /// Payload of the record at global `index`.
    pub fn read(&self, index: u64) -> Result<Vec<u8>> {
        let cycle = self.encoding.to_cycle(index)?;
        let sequence = self.encoding.to_sequence(index);
        let store = self.pool.acquire(cycle, false)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("no cycle file for index")
                .with_cycle(cycle)
                .with_seq(sequence)
        })?;
        let payload = store.read(sequence).map(<[u8]>::to_vec);
        store.release()?;
        payload
    }

    /// Global index of the newest committed record, if any.
    pub fn last_index(&self) -> Result<Option<u64>> {
        for cycle in self.pool.cycles_on_disk()?.into_iter().rev() {
            let Some(store) = self.pool.acquire(cycle, false)? else {
                continue;
            };
            let last = store.last_sequence();
            store.release()?;
            if let Some(sequence) = last? {
                return self.encoding.to_index(cycle, sequence).map(Some);
            }
        }
        Ok(None)
    }

    /// Scans every cycle and cross-checks headers, positions and the index.
    pub fn verify(&self) -> Result<ValidationReport> {
        let mut reports = Vec::new();
        for cycle in self.pool.cycles_on_disk()? {
            let Some(store) = self.pool.acquire(cycle, false)? else {
                continue;
            };
            let report = validate_store_report(&store);
            store.release()?;
            reports.push(report);
        }
        Ok(ValidationReport::merge(self.dir.clone(), reports))
    }

    /// Releases idle stores; fails if handles leaked.
    pub fn close(self) -> Result<()> {
        let leaked = self.pool.close()?;
        if leaked > 0 {
            error!(dir = %self.dir.display(), leaked, "queue closed with outstanding store handles");
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{leaked} store handle(s) still outstanding"))
                .with_path(&self.dir)
                .with_hint("Close every appender before closing the queue."));
        }
        Ok(())
    }
}

fn random_holder() -> Result<u32> {
    loop {
        let mut buf = [0u8; 4];
        getrandom::fill(&mut buf).map_err(|err| {
            Error::new(ErrorKind::Internal).with_message(format!("holder id generation failed: {err}"))
        })?;
        let holder = u32::from_le_bytes(buf) & MAX_HOLDER;
        if holder != 0 {
            return Ok(holder);
        }
    }
}
