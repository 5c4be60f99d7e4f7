//! Purpose: Append records to the queue: cycle selection, locking, reserve/write/commit, indexing.
//! Exports: `Appender`, `DocumentContext`, `AppendOutcome`, `WriteAtOutcome`, `BatchWrite`,
//! `BatchOutcome`, `AppendState`.
//! Role: The single write entry point; every step is an explicit state transition.
//! Invariants: A header is only moved out of `WORKING` while this appender holds the write lock;
//! a writer whose lock was taken over leaves the header to the new holder.
//! Invariants: Any failure between reserve and commit ends in rollback; never a `WORKING` header.
//! Invariants: Sequence assigned = last committed sequence observed under the lock + 1.
//! Invariants: Staged records are flushed before any newer record from the same appender.
use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::core::clock::Clock;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::header::{self, HEADER_SIZE, Reservation};
use crate::core::lock::{LockGuard, LockOutcome, WriteLock};
use crate::core::pretouch::Pretoucher;
use crate::core::roll::{IndexEncoding, RollCycle};
use crate::core::store::{StoreHandle, StorePool};
use crate::core::validate;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendState {
    Idle,
    LockPending,
    HeaderReserved,
    PayloadWritten,
    Committed,
    RolledBack,
    Buffered,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    Committed { index: u64 },
    /// Metadata record written; it carries no sequence number.
    Metadata { offset: usize },
    /// Staged while another writer held the lock.
    Buffered,
    /// Nothing was written, so nothing was committed.
    Discarded,
}

impl AppendOutcome {
    pub fn index(&self) -> Option<u64> {
        match self {
            AppendOutcome::Committed { index } => Some(*index),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteAtOutcome {
    Written { index: u64 },
    /// The index was already committed; nothing changed.
    AlreadyPresent { index: u64 },
}

/// What a batch writer reports after filling a span.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchWrite {
    pub records: usize,
    pub bytes: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchOutcome {
    pub records: u64,
    pub bytes: u64,
    pub last_index: Option<u64>,
}

/// Settings an appender needs from its queue.
#[derive(Clone, Debug)]
pub(crate) struct AppenderSettings {
    pub roll: RollCycle,
    pub epoch_ms: u64,
    pub encoding: IndexEncoding,
    pub clock: Arc<dyn Clock>,
    pub holder: u32,
    pub lock_timeout: Duration,
    pub safe_length: usize,
    pub double_buffer: bool,
    pub check_index: bool,
    pub pretouch_ahead: usize,
}

pub struct Appender {
    pool: StorePool,
    lock: WriteLock,
    settings: AppenderSettings,
    store: Option<StoreHandle>,
    staged: BytesMut,
    staged_records: usize,
    interrupt: Option<Arc<AtomicBool>>,
    last_index: Option<u64>,
    pretoucher: Pretoucher,
    state: Cell<AppendState>,
    closed: bool,
}

impl std::fmt::Debug for Appender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appender")
            .field("holder", &self.settings.holder)
            .field("cycle", &self.cycle())
            .field("state", &self.state.get())
            .field("staged_records", &self.staged_records)
            .finish()
    }
}

impl Appender {
    pub(crate) fn new(pool: StorePool, lock: WriteLock, settings: AppenderSettings) -> Result<Self> {
        let pretoucher = Pretoucher::new(settings.pretouch_ahead);
        let appender = Self {
            pool,
            lock,
            settings,
            store: None,
            staged: BytesMut::new(),
            staged_records: 0,
            interrupt: None,
            last_index: None,
            pretoucher,
            state: Cell::new(AppendState::Idle),
            closed: false,
        };
        appender.end_abandoned_cycles()?;
        Ok(appender)
    }

    /// Rolls back the in-flight document and fails with `Interrupted` once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn holder(&self) -> u32 {
        self.settings.holder
    }

    pub fn state(&self) -> AppendState {
        self.state.get()
    }

    /// Cycle of the store this appender currently writes to.
    pub fn cycle(&self) -> Option<u32> {
        self.store.as_ref().map(|store| store.cycle())
    }

    /// Global index of the last record this appender committed.
    pub fn last_index_appended(&self) -> Result<u64> {
        self.last_index.ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message("no record appended by this appender yet")
        })
    }

    pub fn staged_records(&self) -> usize {
        self.staged_records
    }

    fn enter(&self, next: AppendState) {
        let previous = self.state.replace(next);
        trace!(holder = self.settings.holder, ?previous, ?next, "append state");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::new(ErrorKind::Closed).with_message("appender closed"));
        }
        Ok(())
    }

    /// Fails with `Corrupt` once another writer has taken the lock over.
    fn ensure_lock_held(&self) -> Result<()> {
        let holder = self.settings.holder;
        if self.lock.is_held_by(holder)? {
            return Ok(());
        }
        let owner = self.lock.token()?.map(|token| token.holder);
        Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("holder {holder} lost the write lock (now {owner:?})"))
            .with_hint("A stale-lock takeover recovered this reservation; retry the append."))
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn clock_cycle(&self) -> Result<u32> {
        self.settings
            .roll
            .cycle_at(self.settings.clock.now_millis(), self.settings.epoch_ms)
    }

    fn current_store(&self) -> Result<&StoreHandle> {
        self.store.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("appender has no cycle store")
        })
    }

    /// Terminates cycles left open by writers that stopped before the current cycle began.
    fn end_abandoned_cycles(&self) -> Result<()> {
        let current = self.clock_cycle()?;
        let on_disk = self.pool.cycles_on_disk()?;
        if !on_disk.last().is_some_and(|last| *last < current) {
            return Ok(());
        }
        let guard = self.lock.acquire(self.settings.holder, self.settings.lock_timeout)?;
        let result = self.end_cycles_below(current);
        finish_locked(result, guard)
    }

    /// Writes end-of-cycle markers on open cycles below `target`, newest first, stopping at the
    /// first cycle that is already terminated. Caller holds the write lock.
    fn end_cycles_below(&self, target: u32) -> Result<()> {
        let mut cycles = self.pool.cycles_on_disk()?;
        cycles.retain(|cycle| *cycle < target);
        for cycle in cycles.into_iter().rev() {
            let Some(store) = self.pool.acquire(cycle, false)? else {
                continue;
            };
            let ended = store.recover().and_then(|recovery| {
                if !recovery.is_clean() {
                    warn!(cycle, ?recovery, "repaired cycle before ending it");
                }
                store.write_end_of_cycle()
            });
            store.release()?;
            match ended {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    // A damaged old cycle must not block writes to newer ones.
                    error!(cycle, error = %err, "could not end older cycle");
                    break;
                }
            }
        }
        Ok(())
    }

    fn roll_to(&mut self, target: u32) -> Result<()> {
        let previous = self.cycle();
        if let Some(old) = self.store.take() {
            old.release()?;
        }
        self.end_cycles_below(target)?;
        let store = self.pool.acquire(target, true)?.ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message("cycle store missing after create")
                .with_cycle(target)
        })?;
        self.pool.set_active(target)?;
        debug!(
            holder = self.settings.holder,
            ?previous,
            cycle = target,
            "rolled to cycle"
        );
        self.store = Some(store);
        Ok(())
    }

    fn target_cycle(&self) -> Result<u32> {
        let now = self.clock_cycle()?;
        match self.cycle() {
            Some(current) if now <= current => Ok(current),
            _ => {
                let latest = self.pool.cycles_on_disk()?.last().copied().unwrap_or(now);
                Ok(now.max(latest))
            }
        }
    }

    /// Moves to the right cycle, repairs leftovers and flushes staged records. Lock held.
    fn prepare_locked(&mut self, outcome: LockOutcome) -> Result<()> {
        let target = self.target_cycle()?;
        if self.cycle() != Some(target) {
            self.roll_to(target)?;
        }
        loop {
            let store = self.current_store()?;
            let recovery = store.recover()?;
            if outcome.needs_recovery() || !recovery.is_clean() {
                debug!(cycle = store.cycle(), ?outcome, ?recovery, "recovered store under lock");
            }
            if !store.is_end_of_cycle()? {
                break;
            }
            // Another writer already rolled past this cycle.
            let next = store.cycle() + 1;
            self.roll_to(next)?;
        }
        self.drain_staged()
    }

    fn drain_staged(&mut self) -> Result<()> {
        if self.staged_records == 0 {
            return Ok(());
        }
        let mut pending = std::mem::take(&mut self.staged);
        let count = self.staged_records;
        while pending.has_remaining() {
            let len = pending.get_u32_le() as usize;
            let record = pending.split_to(len);
            if let Err(err) = self.append_locked(&record, false) {
                let mut rest = BytesMut::with_capacity(4 + record.len() + pending.len());
                rest.put_u32_le(len as u32);
                rest.extend_from_slice(&record);
                rest.extend_from_slice(&pending);
                self.staged = rest;
                return Err(err);
            }
            self.staged_records -= 1;
        }
        debug!(holder = self.settings.holder, count, "flushed staged records");
        Ok(())
    }

    fn reserve_length(&self, payload_len: usize, remaining: usize) -> usize {
        let available = remaining.saturating_sub(HEADER_SIZE);
        payload_len.max(self.settings.safe_length.min(available))
    }

    /// Rolls the reservation back; the record is simply not written.
    fn discard(&self, reservation: &Reservation) -> Result<AppendOutcome> {
        self.ensure_lock_held()?;
        let store = self.current_store()?;
        header::rollback(store.data(), reservation).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("rollback of reserved header failed")
                .with_cycle(store.cycle())
                .with_offset(reservation.offset() as u64)
                .with_source(err)
        })?;
        self.enter(AppendState::RolledBack);
        Ok(AppendOutcome::Discarded)
    }

    /// Rolls back after `cause`; a failed rollback is escalated in place of `cause`.
    fn roll_back(&self, reservation: &Reservation, cause: Error) -> Error {
        match self.discard(reservation) {
            Ok(_) => cause,
            Err(err) => {
                error!(offset = reservation.offset(), error = %err, cause = %cause, "rollback failed");
                err
            }
        }
    }

    /// Reserves at the write position. Lock held.
    fn reserve_locked(&self, payload_len: Option<usize>, meta_data: bool) -> Result<Reservation> {
        let store = self.current_store()?;
        let position = store.write_position()?;
        if !meta_data {
            self.settings
                .encoding
                .to_index(store.cycle(), store.next_sequence()?)?;
        }
        let remaining = store.data().limit() - position;
        let max_length = match payload_len {
            Some(len) => self.reserve_length(len, remaining),
            None => self.reserve_length(1, remaining),
        };
        let reservation = header::reserve(store.data(), position, max_length, meta_data)
            .map_err(|err| err.with_cycle(store.cycle()))?;
        self.enter(AppendState::HeaderReserved);
        Ok(reservation)
    }

    fn append_locked(&mut self, payload: &[u8], meta_data: bool) -> Result<AppendOutcome> {
        let reservation = self.reserve_locked(Some(payload.len()), meta_data)?;
        let written = self
            .current_store()
            .and_then(|store| store.data().write_bytes_at(reservation.payload_offset(), payload));
        if let Err(err) = written {
            return Err(self.roll_back(&reservation, err));
        }
        self.enter(AppendState::PayloadWritten);
        self.publish(&reservation, payload.len())
    }

    /// Commits a written reservation and advances position, sequence and index. Lock held.
    fn publish(&mut self, reservation: &Reservation, length: usize) -> Result<AppendOutcome> {
        if length == 0 && !reservation.is_meta_data() {
            return self.discard(reservation);
        }
        if self.interrupted() {
            return Err(self.roll_back(
                reservation,
                Error::new(ErrorKind::Interrupted).with_message("append interrupted before commit"),
            ));
        }
        self.ensure_lock_held()?;
        let store = self.current_store()?;
        if let Err(err) = header::commit(store.data(), reservation, length) {
            if err.kind() == ErrorKind::Corrupt {
                return Err(err);
            }
            return Err(self.roll_back(reservation, err));
        }
        let position = reservation.offset();
        let next = header::next_record(position, length);
        if reservation.is_meta_data() {
            store.set_write_position(next)?;
            self.enter(AppendState::Committed);
            return Ok(AppendOutcome::Metadata {
                offset: reservation.payload_offset(),
            });
        }

        let sequence = store.next_sequence()?;
        let index = self.settings.encoding.to_index(store.cycle(), sequence)?;
        store.set_last_sequence(sequence)?;
        store.set_write_position(next)?;
        store.index_record(sequence, position)?;
        if cfg!(debug_assertions) && self.settings.check_index {
            let derived = store.sequence_for_position(position)?;
            if derived != sequence {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "index derives sequence {derived} for a record committed as {sequence}"
                    ))
                    .with_cycle(store.cycle())
                    .with_offset(position as u64));
            }
        }
        self.last_index = Some(index);
        self.enter(AppendState::Committed);
        Ok(AppendOutcome::Committed { index })
    }

    fn stage(&mut self, payload: &[u8]) -> Result<AppendOutcome> {
        if payload.len() > header::MAX_LENGTH {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("record of {} bytes exceeds header length", payload.len())));
        }
        self.staged.reserve(4 + payload.len());
        self.staged.put_u32_le(payload.len() as u32);
        self.staged.extend_from_slice(payload);
        self.staged_records += 1;
        self.enter(AppendState::Buffered);
        trace!(holder = self.settings.holder, staged = self.staged_records, "staged record");
        Ok(AppendOutcome::Buffered)
    }

    /// Appends one record. With double buffering on and the lock busy, the record is staged
    /// and written by a later call instead.
    pub fn append(&mut self, payload: &[u8]) -> Result<AppendOutcome> {
        self.ensure_open()?;
        if payload.is_empty() {
            self.enter(AppendState::Idle);
            return Ok(AppendOutcome::Discarded);
        }
        self.enter(AppendState::LockPending);
        if self.settings.double_buffer && self.lock.locked()? {
            return self.stage(payload);
        }
        let guard = self.lock.acquire(self.settings.holder, self.settings.lock_timeout)?;
        let result = self
            .prepare_locked(guard.outcome())
            .and_then(|()| self.append_locked(payload, false));
        let outcome = finish_locked(result, guard)?;
        self.enter(AppendState::Idle);
        Ok(outcome)
    }

    /// Writes staged records now, waiting for the lock. Returns how many were flushed.
    pub fn flush_staged(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let before = self.staged_records;
        if before == 0 {
            return Ok(0);
        }
        self.enter(AppendState::LockPending);
        let guard = self.lock.acquire(self.settings.holder, self.settings.lock_timeout)?;
        let result = self.prepare_locked(guard.outcome());
        finish_locked(result, guard)?;
        self.enter(AppendState::Idle);
        Ok(before - self.staged_records)
    }

    /// Opens a document: the lock is held and a header reserved until the context is closed.
    pub fn writing_document(&mut self, meta_data: bool) -> Result<DocumentContext<'_>> {
        self.ensure_open()?;
        self.enter(AppendState::LockPending);
        let guard = self.lock.acquire(self.settings.holder, self.settings.lock_timeout)?;
        let reserved = self
            .prepare_locked(guard.outcome())
            .and_then(|()| self.reserve_locked(None, meta_data));
        let reservation = match reserved {
            Ok(reservation) => reservation,
            Err(err) => return finish_locked(Err(err), guard),
        };
        Ok(DocumentContext {
            appender: self,
            guard: Some(guard),
            reservation,
            written: 0,
            rollback_on_close: false,
            finished: false,
        })
    }

    /// Appends whatever `write` produces; writing nothing discards the document.
    pub fn write_with<F>(&mut self, write: F) -> Result<AppendOutcome>
    where
        F: FnOnce(&mut DocumentContext<'_>) -> Result<()>,
    {
        let mut document = self.writing_document(false)?;
        write(&mut document)?;
        document.close()
    }

    /// Appends `payload` only if `index` is the next index of its cycle. Earlier indices are
    /// reported as already present; gaps are rejected.
    pub fn write_at_index(&mut self, index: u64, payload: &[u8]) -> Result<WriteAtOutcome> {
        self.ensure_open()?;
        if payload.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("empty record"));
        }
        let encoding = self.settings.encoding;
        let cycle = encoding.to_cycle(index)?;
        let sequence = encoding.to_sequence(index);

        self.enter(AppendState::LockPending);
        let guard = self.lock.acquire(self.settings.holder, self.settings.lock_timeout)?;
        let result = self.write_at_locked(cycle, sequence, index, payload);
        let outcome = finish_locked(result, guard)?;
        self.enter(AppendState::Idle);
        Ok(outcome)
    }

    fn write_at_locked(
        &mut self,
        cycle: u32,
        sequence: u64,
        index: u64,
        payload: &[u8],
    ) -> Result<WriteAtOutcome> {
        let newest = self.pool.cycles_on_disk()?.last().copied().max(self.cycle());
        if newest.is_some_and(|newest| cycle < newest) {
            return self.write_behind_newest(cycle, sequence, index);
        }
        if self.cycle() != Some(cycle) {
            self.roll_to(cycle)?;
        }
        let store = self.current_store()?;
        store.recover()?;
        if store.is_end_of_cycle()? {
            return replay_or_reject(index, sequence, store.next_sequence()?, cycle);
        }
        self.drain_staged()?;
        let next = self.current_store()?.next_sequence()?;
        if sequence != next {
            return replay_or_reject(index, sequence, next, cycle);
        }
        match self.append_locked(payload, false)? {
            AppendOutcome::Committed { index: written } if written == index => {
                Ok(WriteAtOutcome::Written { index })
            }
            other => Err(Error::new(ErrorKind::Internal)
                .with_message(format!("write_at_index committed {other:?} instead of {index}"))),
        }
    }

    /// `cycle` is older than a cycle already written; only replays are accepted.
    fn write_behind_newest(&self, cycle: u32, sequence: u64, index: u64) -> Result<WriteAtOutcome> {
        let store = self.pool.acquire(cycle, false)?;
        let next = match &store {
            Some(store) => store.next_sequence(),
            None => Ok(0),
        };
        if let Some(store) = store {
            store.release()?;
        }
        let next = next?;
        if sequence < next {
            warn!(index, cycle, "write_at_index replay of an earlier cycle ignored");
            return Ok(WriteAtOutcome::AlreadyPresent { index });
        }
        Err(Error::new(ErrorKind::OrderingViolation)
            .with_message("cannot write into a cycle older than the newest cycle")
            .with_cycle(cycle)
            .with_seq(sequence))
    }

    /// Bulk append: `writer` fills raw spans with pre-framed records, one lock hold per span.
    ///
    /// Each span starts at the write position, is zeroed, and is sized to at most `max_bytes`
    /// in total across the call. A span accepts at most the records left before the next
    /// indexed sequence, so index entries stay exact. Stops when `writer` reports no records,
    /// `max_bytes` is used, or `timeout` elapses.
    ///
    /// # Safety
    /// `writer` must write only complete records framed as a `READY` data header (the payload
    /// length, state bits clear) followed by the payload, each starting 4-byte aligned and
    /// directly after the previous one. It must report exactly the records and bytes written
    /// (bytes including alignment padding) and leave the rest of the span zero. Framing is not
    /// re-validated; a misreported span corrupts the cycle.
    pub unsafe fn batch_append<F>(
        &mut self,
        timeout: Duration,
        max_bytes: usize,
        mut writer: F,
    ) -> Result<BatchOutcome>
    where
        F: FnMut(&mut [u8], usize) -> BatchWrite,
    {
        self.ensure_open()?;
        let started = Instant::now();
        let mut outcome = BatchOutcome::default();
        while (outcome.bytes as usize) < max_bytes && started.elapsed() < timeout {
            self.enter(AppendState::LockPending);
            let guard = self.lock.acquire(self.settings.holder, self.settings.lock_timeout)?;
            let budget = max_bytes - outcome.bytes as usize;
            let result = self
                .prepare_locked(guard.outcome())
                // SAFETY: the caller upholds the framing contract for `writer`.
                .and_then(|()| unsafe { self.batch_span_locked(budget, &mut writer) });
            let span = finish_locked(result, guard)?;
            if span.records == 0 {
                break;
            }
            outcome.records += span.records as u64;
            outcome.bytes += span.bytes as u64;
            outcome.last_index = self.last_index;
        }
        self.enter(AppendState::Idle);
        Ok(outcome)
    }

    /// # Safety
    /// See `batch_append`.
    unsafe fn batch_span_locked<F>(&mut self, budget: usize, writer: &mut F) -> Result<BatchWrite>
    where
        F: FnMut(&mut [u8], usize) -> BatchWrite,
    {
        let store = self.current_store()?;
        let position = store.write_position()?;
        let sequence = store.next_sequence()?;
        let spacing = store.index().spacing();
        let max_records = (spacing - sequence % spacing) as usize;
        let span_len = (store.data().limit() - position).min(budget) & !(header::RECORD_ALIGN - 1);
        if span_len <= HEADER_SIZE {
            return Ok(BatchWrite::default());
        }
        store.data().zero_range(position, position + span_len, true)?;
        // SAFETY: the write lock is held and the span lies past every committed record.
        let span = unsafe { store.data().bytes_mut_at(position, span_len)? };
        self.enter(AppendState::HeaderReserved);
        let written = writer(span, max_records);
        if written.records == 0 {
            return Ok(BatchWrite::default());
        }
        if written.records > max_records
            || written.bytes > span_len
            || written.bytes % header::RECORD_ALIGN != 0
            || written.bytes < written.records * HEADER_SIZE
        {
            store.data().zero_range(position, position + span_len, true)?;
            self.enter(AppendState::RolledBack);
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "batch writer reported {} records in {} bytes for a span of {span_len} allowing {max_records}",
                    written.records, written.bytes
                ))
                .with_offset(position as u64));
        }
        self.enter(AppendState::PayloadWritten);

        let last_sequence = sequence + written.records as u64 - 1;
        let index = self.settings.encoding.to_index(store.cycle(), last_sequence)?;
        store.set_last_sequence(last_sequence)?;
        store.set_write_position(position + written.bytes)?;
        store.index_record(sequence, position)?;
        store.index().skip_to(last_sequence + 1)?;
        self.last_index = Some(index);
        self.enter(AppendState::Committed);
        Ok(written)
    }

    /// Pre-faults pages ahead of the write position. Never blocks on the write lock.
    pub fn pretouch(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        self.pretoucher.execute(store)
    }

    /// Flushes staged records and releases the current store.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.flush_staged().map(|_| ());
        self.closed = true;
        if cfg!(debug_assertions) && self.settings.check_index {
            self.assert_store_state();
        }
        let released = match self.store.take() {
            Some(store) => store.release(),
            None => Ok(()),
        };
        flushed.and(released)
    }
}

impl Appender {
    /// Full-cycle consistency check; skipped when another writer holds the lock.
    fn assert_store_state(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let guard = match self.lock.acquire(self.settings.holder, Duration::ZERO) {
            Ok(guard) => guard,
            Err(err) => {
                debug!(holder = self.settings.holder, error = %err, "skipped store check");
                return;
            }
        };
        if guard.outcome() == LockOutcome::Acquired {
            validate::debug_assert_store_state(store.store());
        }
        if let Err(err) = guard.release() {
            error!(holder = self.settings.holder, error = %err, "unlock failed after store check");
        }
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.staged_records > 0 {
            warn!(
                holder = self.settings.holder,
                staged = self.staged_records,
                "appender dropped with staged records; flushing"
            );
        }
        if let Err(err) = self.shutdown() {
            error!(holder = self.settings.holder, error = %err, "appender shutdown failed");
        }
    }
}

/// Outcome of a `write_at_index` whose sequence is not the next one: replays are accepted,
/// anything else would leave a gap.
fn replay_or_reject(index: u64, sequence: u64, next: u64, cycle: u32) -> Result<WriteAtOutcome> {
    if sequence < next {
        warn!(index, cycle, next, "write_at_index replay ignored");
        return Ok(WriteAtOutcome::AlreadyPresent { index });
    }
    Err(Error::new(ErrorKind::OrderingViolation)
        .with_message(format!("index leaves a gap; next sequence is {next}"))
        .with_cycle(cycle)
        .with_seq(sequence))
}

/// Releases `guard`, preferring the operation's own error over an unlock failure.
fn finish_locked<T>(result: Result<T>, guard: LockGuard) -> Result<T> {
    let holder = guard.holder();
    match (result, guard.release()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(unlock)) => Err(unlock),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(unlock)) => {
            error!(holder, error = %unlock, "unlock failed after append error");
            Err(err)
        }
    }
}

/// An open record: payload bytes go straight into the reserved span of the mapped file.
///
/// `close` commits; dropping without `close` rolls back. Either way the lock is released.
pub struct DocumentContext<'a> {
    appender: &'a mut Appender,
    guard: Option<LockGuard>,
    reservation: Reservation,
    written: usize,
    rollback_on_close: bool,
    finished: bool,
}

impl DocumentContext<'_> {
    pub fn is_meta_data(&self) -> bool {
        self.reservation.is_meta_data()
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Payload bytes still available in the reservation.
    pub fn remaining(&self) -> usize {
        self.reservation.max_length() - self.written
    }

    /// Discards the document when it is closed.
    pub fn rollback_on_close(&mut self) {
        self.rollback_on_close = true;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message(format!(
                    "document of {} bytes exceeds reservation of {}",
                    self.written + bytes.len(),
                    self.reservation.max_length()
                ))
                .with_offset(self.reservation.offset() as u64));
        }
        self.appender.ensure_lock_held()?;
        let store = self.appender.current_store()?;
        store
            .data()
            .write_bytes_at(self.reservation.payload_offset() + self.written, bytes)?;
        self.written += bytes.len();
        if self.appender.state() == AppendState::HeaderReserved {
            self.appender.enter(AppendState::PayloadWritten);
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<AppendOutcome> {
        self.finished = true;
        let reservation = self.reservation;
        let result = if self.rollback_on_close {
            self.appender.discard(&reservation)
        } else {
            self.appender.publish(&reservation, self.written)
        };
        let guard = self.guard.take().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("document lost its lock guard")
        })?;
        let outcome = finish_locked(result, guard)?;
        self.appender.enter(AppendState::Idle);
        Ok(outcome)
    }
}

impl io::Write for DocumentContext<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(self.remaining());
        if len == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "document reservation full"));
        }
        self.write_bytes(&buf[..len]).map_err(io::Error::other)?;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DocumentContext<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let reservation = self.reservation;
        let cause = Error::new(ErrorKind::Interrupted).with_message("document dropped before close");
        let err = self.appender.roll_back(&reservation, cause);
        if err.kind() != ErrorKind::Interrupted {
            error!(error = %err, "document rollback failed");
        } else {
            debug!(offset = reservation.offset(), "document dropped; rolled back");
        }
        if let Some(guard) = self.guard.take() {
            if let Err(err) = guard.release() {
                error!(error = %err, "unlock failed after document rollback");
            }
        }
        self.appender.enter(AppendState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::{AppendOutcome, AppendState, BatchWrite, WriteAtOutcome};
    use crate::core::clock::SetClock;
    use crate::core::error::ErrorKind;
    use crate::core::header;
    use crate::core::queue::{Queue, QueueOptions};
    use crate::core::roll::RollCycle;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const DAY_MS: u64 = 86_400_000;

    fn options(clock: &SetClock) -> QueueOptions {
        QueueOptions::new()
            .with_roll_cycle(RollCycle::Daily)
            .with_cycle_capacity(256 * 1024)
            .with_index_count(8)
            .with_index_spacing(4)
            .with_safe_length(4096)
            .with_lock_timeout(Duration::from_millis(50))
            .with_clock(Arc::new(clock.clone()))
            .with_check_index(true)
    }

    #[test]
    fn append_returns_packed_global_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS * 100 + 5);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");

        let first = appender.append(b"one").expect("append");
        let second = appender.append(b"two").expect("append");
        assert_eq!(first, AppendOutcome::Committed { index: 100u64 << 32 });
        assert_eq!(second.index(), Some((100u64 << 32) | 1));
        assert_eq!(appender.cycle(), Some(100));
        assert_eq!(appender.last_index_appended().expect("last"), (100u64 << 32) | 1);
        assert_eq!(appender.state(), AppendState::Idle);
        assert_eq!(queue.read(100u64 << 32).expect("read"), b"one");
        appender.close().expect("close");
    }

    #[test]
    fn empty_append_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");
        assert_eq!(appender.append(b"").expect("empty"), AppendOutcome::Discarded);
        assert!(appender.last_index_appended().is_err());
    }

    #[test]
    fn document_commits_on_close_and_rolls_back_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");

        {
            let mut doc = appender.writing_document(false).expect("doc");
            doc.write_all(b"abandoned").expect("write");
        }
        let mut doc = appender.writing_document(false).expect("doc");
        write!(doc, "hello {}", 7).expect("write");
        let outcome = doc.close().expect("close");
        assert_eq!(outcome.index(), Some(1u64 << 32));
        assert_eq!(queue.read(1u64 << 32).expect("read"), b"hello 7");
        assert!(queue.read((1u64 << 32) | 1).is_err());
    }

    #[test]
    fn document_rollback_on_close_and_empty_write_with_discard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");

        let mut doc = appender.writing_document(false).expect("doc");
        doc.write_bytes(b"never").expect("write");
        doc.rollback_on_close();
        assert_eq!(doc.close().expect("close"), AppendOutcome::Discarded);
        assert_eq!(appender.state(), AppendState::Idle);

        let outcome = appender.write_with(|_| Ok(())).expect("write_with");
        assert_eq!(outcome, AppendOutcome::Discarded);
        let outcome = appender
            .write_with(|doc| doc.write_bytes(b"kept"))
            .expect("write_with");
        assert_eq!(outcome.index(), Some(1u64 << 32));
    }

    #[test]
    fn metadata_documents_take_no_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");

        let mut doc = appender.writing_document(true).expect("meta");
        doc.write_bytes(b"header").expect("write");
        assert!(matches!(doc.close().expect("close"), AppendOutcome::Metadata { .. }));
        let outcome = appender.append(b"data").expect("append");
        assert_eq!(outcome.index(), Some(1u64 << 32));
    }

    #[test]
    fn interrupt_rolls_back_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let flag = Arc::new(AtomicBool::new(false));
        let mut appender = queue
            .acquire_appender()
            .expect("appender")
            .with_interrupt(Arc::clone(&flag));

        let mut doc = appender.writing_document(false).expect("doc");
        doc.write_bytes(b"partial").expect("write");
        flag.store(true, Ordering::Release);
        let err = doc.close().expect_err("interrupted");
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert_eq!(appender.state(), AppendState::RolledBack);

        flag.store(false, Ordering::Release);
        let outcome = appender.append(b"after").expect("append");
        assert_eq!(outcome.index(), Some(1u64 << 32));
        assert!(!queue.lock_held().expect("lock state"));
    }

    #[test]
    fn oversized_document_write_is_bounds_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");

        let mut doc = appender.writing_document(false).expect("doc");
        let err = doc.write_bytes(&vec![0u8; 4097]).expect_err("too big");
        assert_eq!(err.kind(), ErrorKind::Bounds);
        drop(doc);
        assert!(!queue.lock_held().expect("lock state"));
    }

    #[test]
    fn staged_records_flush_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock).with_double_buffer(true))
            .expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");
        let mut other = queue.acquire_appender().expect("other");

        let doc = other.writing_document(false).expect("hold lock");
        assert_eq!(appender.append(b"a").expect("stage"), AppendOutcome::Buffered);
        assert_eq!(appender.append(b"b").expect("stage"), AppendOutcome::Buffered);
        assert_eq!(appender.staged_records(), 2);
        drop(doc);

        let outcome = appender.append(b"c").expect("append");
        assert_eq!(outcome.index(), Some((1u64 << 32) | 2));
        assert_eq!(appender.staged_records(), 0);
        assert_eq!(queue.read(1u64 << 32).expect("read"), b"a");
        assert_eq!(queue.read((1u64 << 32) | 1).expect("read"), b"b");
    }

    #[test]
    fn write_at_index_replays_and_rejects_gaps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");
        let base = 3u64 << 32;

        assert_eq!(
            appender.write_at_index(base, b"zero").expect("write"),
            WriteAtOutcome::Written { index: base }
        );
        assert_eq!(
            appender.write_at_index(base, b"zero").expect("replay"),
            WriteAtOutcome::AlreadyPresent { index: base }
        );
        let err = appender
            .write_at_index(base + 2, b"gap")
            .expect_err("gap");
        assert_eq!(err.kind(), ErrorKind::OrderingViolation);
        assert_eq!(appender.cycle(), Some(3));
    }

    #[test]
    fn write_at_index_counts_staged_records_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock).with_double_buffer(true))
            .expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");
        let mut other = queue.acquire_appender().expect("other");
        let base = 1u64 << 32;

        let doc = other.writing_document(false).expect("hold lock");
        assert_eq!(appender.append(b"staged").expect("stage"), AppendOutcome::Buffered);
        drop(doc);

        assert_eq!(
            appender.write_at_index(base, b"replica").expect("replay"),
            WriteAtOutcome::AlreadyPresent { index: base }
        );
        assert_eq!(appender.staged_records(), 0);
        assert_eq!(queue.read(base).expect("read"), b"staged");
        assert_eq!(queue.last_index().expect("last"), Some(base));

        let doc = other.writing_document(false).expect("hold lock");
        assert_eq!(appender.append(b"second").expect("stage"), AppendOutcome::Buffered);
        drop(doc);
        assert_eq!(
            appender.write_at_index(base + 2, b"replica").expect("write"),
            WriteAtOutcome::Written { index: base + 2 }
        );
        assert_eq!(queue.read(base + 1).expect("read"), b"second");
        assert_eq!(queue.read(base + 2).expect("read"), b"replica");
    }

    #[test]
    fn write_at_index_never_goes_behind_the_newest_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut writer = queue.acquire_appender().expect("appender");
        writer.write_at_index(3u64 << 32, b"three").expect("cycle 3");
        writer.write_at_index(5u64 << 32, b"five").expect("cycle 5");
        writer.close().expect("close");

        let mut fresh = queue.acquire_appender().expect("fresh appender");
        assert_eq!(
            fresh.write_at_index(3u64 << 32, b"three").expect("replay"),
            WriteAtOutcome::AlreadyPresent { index: 3u64 << 32 }
        );
        for index in [(3u64 << 32) | 1, 4u64 << 32] {
            let err = fresh.write_at_index(index, b"x").expect_err("behind newest");
            assert_eq!(err.kind(), ErrorKind::OrderingViolation);
        }
        assert_eq!(fresh.cycle(), None);
        assert_eq!(
            fresh.write_at_index(5u64 << 32, b"five").expect("replay"),
            WriteAtOutcome::AlreadyPresent { index: 5u64 << 32 }
        );
        assert_eq!(queue.first_cycle().expect("first"), Some(3));
        assert_eq!(queue.last_cycle().expect("last"), Some(5));
        assert_eq!(queue.read(4u64 << 32).expect_err("absent").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn batch_append_respects_index_spacing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");
        appender.append(b"first").expect("append");

        let mut spans = Vec::new();
        let outcome = unsafe {
            appender.batch_append(Duration::from_secs(5), 10 * 12, |span, max_records| {
                spans.push(max_records);
                let mut offset = 0;
                let mut records = 0;
                while records < max_records && offset + 12 <= span.len() {
                    let word = header::ready_word(8, false).to_le_bytes();
                    span[offset..offset + 4].copy_from_slice(&word);
                    span[offset + 4..offset + 12].copy_from_slice(b"batched!");
                    offset += 12;
                    records += 1;
                }
                BatchWrite { records, bytes: offset }
            })
        }
        .expect("batch");
        assert_eq!(spans[0], 3);
        assert_eq!(outcome.records, 10);
        assert_eq!(outcome.last_index, Some((1u64 << 32) | 10));
        for seq in 1..=10u64 {
            assert_eq!(queue.read((1u64 << 32) | seq).expect("read"), b"batched!");
        }
        assert_eq!(
            appender.append(b"after").expect("append").index(),
            Some((1u64 << 32) | 11)
        );
    }

    #[test]
    fn closed_appender_rejects_writes_and_releases_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = SetClock::new(DAY_MS);
        let queue = Queue::open(dir.path(), options(&clock)).expect("queue");
        let mut appender = queue.acquire_appender().expect("appender");
        appender.append(b"x").expect("append");
        assert_eq!(queue.outstanding_handles(), 1);
        appender.close().expect("close");
        assert_eq!(queue.outstanding_handles(), 0);
        queue.close().expect("close queue");
    }
}
