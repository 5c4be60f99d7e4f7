//! Purpose: Cross-process write lock stored as one atomic token in a mapped lock file.
//! Exports: `WriteLock`, `LockGuard`, `LockOutcome`, `LockToken`.
//! Role: The only coordination point between appenders; gates every header transition.
//! Invariants: Token 0 means unlocked; otherwise it encodes holder id and acquisition time.
//! Invariants: Only the holder named in the token may unlock; a mismatch is fatal corruption.
//! Invariants: A token older than the stale threshold may be taken over; the new holder repairs
//! whatever the previous holder left before writing.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, error, warn};

use crate::core::clock::Clock;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::format::{
    LOCK_FILE_SIZE, LOCK_TOKEN_OFFSET, encode_lock_prologue, validate_lock_prologue,
};
use crate::core::region::MappedRegion;

pub const LOCK_FILE_NAME: &str = "queue.lock";
pub const HOLDER_BITS: u32 = 22;
pub const MAX_HOLDER: u32 = (1 << HOLDER_BITS) - 1;
const TIME_BITS: u32 = 64 - HOLDER_BITS;
const TIME_MASK: u64 = (1 << TIME_BITS) - 1;

const SPIN_ATTEMPTS: u32 = 64;
const YIELD_ATTEMPTS: u32 = 256;
const SLEEP_STEP: Duration = Duration::from_micros(50);

/// Decoded lock word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockToken {
    pub holder: u32,
    pub acquired_at_ms: u64,
}

impl LockToken {
    pub fn encode(&self) -> u64 {
        (u64::from(self.holder) << TIME_BITS) | (self.acquired_at_ms & TIME_MASK)
    }

    pub fn decode(word: u64) -> Option<Self> {
        if word == 0 {
            return None;
        }
        Some(Self {
            holder: (word >> TIME_BITS) as u32,
            acquired_at_ms: word & TIME_MASK,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockOutcome {
    Acquired,
    /// Taken over from a holder presumed crashed; the caller must run recovery first.
    Recovered { previous_holder: u32 },
}

impl LockOutcome {
    pub fn needs_recovery(&self) -> bool {
        matches!(self, LockOutcome::Recovered { .. })
    }
}

#[derive(Clone, Debug)]
pub struct WriteLock {
    path: PathBuf,
    region: MappedRegion,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl WriteLock {
    /// Opens (creating on first use) the lock file under `dir`.
    pub fn open(dir: &Path, clock: Arc<dyn Clock>, stale_after: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::io(err).with_path(&path))?;

        file.lock_exclusive()
            .map_err(|err| Error::io(err).with_path(&path))?;
        let prepared = prepare_lock_file(&mut file, &path);
        let unlocked = FileExt::unlock(&file).map_err(|err| Error::io(err).with_path(&path));
        prepared?;
        unlocked?;

        let region = MappedRegion::map(&file, &path)?;
        Ok(Self {
            path,
            region,
            clock,
            stale_after,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn token(&self) -> Result<Option<LockToken>> {
        Ok(LockToken::decode(
            self.region.read_volatile_u64(LOCK_TOKEN_OFFSET)?,
        ))
    }

    /// Non-blocking probe.
    pub fn locked(&self) -> Result<bool> {
        Ok(self.token()?.is_some())
    }

    pub fn is_held_by(&self, holder: u32) -> Result<bool> {
        Ok(self.token()?.is_some_and(|token| token.holder == holder))
    }

    fn is_stale(&self, token: &LockToken, now_ms: u64) -> bool {
        now_ms.saturating_sub(token.acquired_at_ms) > self.stale_after.as_millis() as u64
    }

    pub fn try_lock(&self, holder: u32, timeout: Duration) -> Result<LockOutcome> {
        if holder == 0 || holder > MAX_HOLDER {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("holder id {holder} outside 1..={MAX_HOLDER}")));
        }
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            let now_ms = self.clock.now_millis();
            let mine = LockToken {
                holder,
                acquired_at_ms: now_ms,
            }
            .encode();
            let current = self.region.read_volatile_u64(LOCK_TOKEN_OFFSET)?;
            match LockToken::decode(current) {
                None => {
                    if self
                        .region
                        .compare_and_swap_u64(LOCK_TOKEN_OFFSET, 0, mine)?
                    {
                        return Ok(LockOutcome::Acquired);
                    }
                }
                Some(token) if token.holder == holder => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!("holder {holder} already owns the write lock"))
                        .with_path(&self.path));
                }
                Some(token) if self.is_stale(&token, now_ms) => {
                    if self
                        .region
                        .compare_and_swap_u64(LOCK_TOKEN_OFFSET, current, mine)?
                    {
                        warn!(
                            previous_holder = token.holder,
                            held_for_ms = now_ms.saturating_sub(token.acquired_at_ms),
                            holder,
                            "took over stale write lock"
                        );
                        return Ok(LockOutcome::Recovered {
                            previous_holder: token.holder,
                        });
                    }
                }
                Some(_) => {}
            }

            if started.elapsed() >= timeout {
                return Err(Error::new(ErrorKind::LockTimeout)
                    .with_message(format!(
                        "write lock not acquired within {}ms",
                        timeout.as_millis()
                    ))
                    .with_path(&self.path)
                    .with_hint("Retry the append, or raise the lock timeout."));
            }
            backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
    }

    pub fn unlock(&self, holder: u32) -> Result<()> {
        let current = self.region.read_volatile_u64(LOCK_TOKEN_OFFSET)?;
        let token = LockToken::decode(current).ok_or_else(|| {
            Error::new(ErrorKind::Corrupt)
                .with_message(format!("holder {holder} unlocking a free write lock"))
                .with_path(&self.path)
        })?;
        if token.holder != holder {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "holder {holder} unlocking a write lock owned by {}",
                    token.holder
                ))
                .with_path(&self.path));
        }
        if !self
            .region
            .compare_and_swap_u64(LOCK_TOKEN_OFFSET, current, 0)?
        {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("write lock of holder {holder} changed during unlock"))
                .with_path(&self.path));
        }
        Ok(())
    }

    /// Acquires the lock and returns a guard that unlocks on release or drop.
    pub fn acquire(&self, holder: u32, timeout: Duration) -> Result<LockGuard> {
        let outcome = self.try_lock(holder, timeout)?;
        Ok(LockGuard {
            lock: self.clone(),
            holder,
            outcome,
            released: false,
        })
    }
}

fn prepare_lock_file(file: &mut File, path: &Path) -> Result<()> {
    let len = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::io(err).with_path(path))?;
    if len == 0 {
        file.set_len(LOCK_FILE_SIZE as u64)
            .map_err(|err| Error::io(err).with_path(path))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|err| Error::io(err).with_path(path))?;
        file.write_all(&encode_lock_prologue())
            .map_err(|err| Error::io(err).with_path(path))?;
        file.flush().map_err(|err| Error::io(err).with_path(path))?;
        debug!(path = %path.display(), "created lock file");
        return Ok(());
    }
    let mut buf = [0u8; LOCK_FILE_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::io(err).with_path(path))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::io(err).with_path(path))?;
    validate_lock_prologue(&buf).map_err(|err| err.with_path(path))
}

fn backoff(attempts: u32) {
    if attempts < SPIN_ATTEMPTS {
        std::hint::spin_loop();
    } else if attempts < YIELD_ATTEMPTS {
        thread::yield_now();
    } else {
        thread::sleep(SLEEP_STEP);
    }
}

/// Held write lock. Prefer `release` so unlock failures surface; drop unlocks best-effort.
#[derive(Debug)]
pub struct LockGuard {
    lock: WriteLock,
    holder: u32,
    outcome: LockOutcome,
    released: bool,
}

impl LockGuard {
    pub fn holder(&self) -> u32 {
        self.holder
    }

    pub fn outcome(&self) -> LockOutcome {
        self.outcome
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.unlock(self.holder)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.lock.unlock(self.holder) {
            error!(holder = self.holder, error = %err, "write lock dropped without a clean unlock");
        }
    }
}
