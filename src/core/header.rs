// Record framing word: 2 state bits packed with a 30-bit payload length, plus the
// reserve/commit/rollback transitions applied to it in mapped memory.
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::region::MappedRegion;

pub const HEADER_SIZE: usize = 4;
pub const NOT_INITIALIZED: u32 = 0;
pub const WORKING: u32 = 0x8000_0000;
pub const META_DATA: u32 = 0x4000_0000;
pub const LENGTH_MASK: u32 = 0x3FFF_FFFF;
pub const END_OF_CYCLE: u32 = WORKING | META_DATA;
pub const MAX_LENGTH: usize = LENGTH_MASK as usize;
pub const RECORD_ALIGN: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderState {
    NotInitialized,
    Working,
    Ready,
    MetaData,
    EndOfCycle,
}

pub fn state(word: u32) -> HeaderState {
    if word == NOT_INITIALIZED {
        HeaderState::NotInitialized
    } else if word == END_OF_CYCLE {
        HeaderState::EndOfCycle
    } else if word & WORKING != 0 {
        HeaderState::Working
    } else if word & META_DATA != 0 {
        HeaderState::MetaData
    } else {
        HeaderState::Ready
    }
}

pub fn length(word: u32) -> usize {
    (word & LENGTH_MASK) as usize
}

/// Complete record, data or metadata.
pub fn is_ready(word: u32) -> bool {
    word != NOT_INITIALIZED && word & WORKING == 0
}

pub fn is_ready_data(word: u32) -> bool {
    is_ready(word) && word & META_DATA == 0
}

pub fn is_working(word: u32) -> bool {
    word & WORKING != 0 && word != END_OF_CYCLE
}

pub fn is_not_initialized(word: u32) -> bool {
    word == NOT_INITIALIZED
}

pub fn is_meta_data(word: u32) -> bool {
    word & META_DATA != 0 && word != END_OF_CYCLE
}

pub fn is_end_of_cycle(word: u32) -> bool {
    word == END_OF_CYCLE
}

pub fn align(value: usize) -> usize {
    (value + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// Offset of the header following a record of `len` payload bytes at `offset`.
pub fn next_record(offset: usize, len: usize) -> usize {
    align(offset + HEADER_SIZE + len)
}

pub fn ready_word(len: usize, meta_data: bool) -> u32 {
    let flag = if meta_data { META_DATA } else { 0 };
    flag | (len as u32 & LENGTH_MASK)
}

fn working_word(max_length: usize, meta_data: bool) -> u32 {
    WORKING | ready_word(max_length, meta_data)
}

/// Proof that the header at `offset` was moved to `WORKING` by this caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reservation {
    offset: usize,
    max_length: usize,
    meta_data: bool,
}

impl Reservation {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn payload_offset(&self) -> usize {
        self.offset + HEADER_SIZE
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn is_meta_data(&self) -> bool {
        self.meta_data
    }

    fn word(&self) -> u32 {
        working_word(self.max_length, self.meta_data)
    }
}

/// `NOT_INITIALIZED -> WORKING` at `offset`, reserving `max_length` payload bytes.
pub fn reserve(
    region: &MappedRegion,
    offset: usize,
    max_length: usize,
    meta_data: bool,
) -> Result<Reservation> {
    if max_length == 0 || max_length > MAX_LENGTH {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("reservation length {max_length} outside 1..={MAX_LENGTH}"))
            .with_offset(offset as u64));
    }
    let fits = offset >= region.start()
        && offset
            .checked_add(HEADER_SIZE + max_length)
            .is_some_and(|end| end <= region.limit());
    if !fits {
        return Err(Error::new(ErrorKind::Bounds)
            .with_message(format!(
                "reservation of {max_length} bytes exceeds remaining capacity"
            ))
            .with_offset(offset as u64));
    }

    let reservation = Reservation {
        offset,
        max_length,
        meta_data,
    };
    if region.compare_and_swap_u32(offset, NOT_INITIALIZED, reservation.word())? {
        return Ok(reservation);
    }
    let found = region.read_volatile_u32(offset)?;
    Err(Error::new(ErrorKind::Contention)
        .with_message(format!("header already {:?}", state(found)))
        .with_offset(offset as u64))
}

/// `WORKING -> READY` as a CAS from the reserved word, so readers observing `READY` see the
/// payload and a header reset or re-reserved by someone else is never overwritten.
pub fn commit(region: &MappedRegion, reservation: &Reservation, final_length: usize) -> Result<()> {
    if final_length > reservation.max_length {
        return Err(Error::new(ErrorKind::Bounds)
            .with_message(format!(
                "record length {final_length} exceeds reservation {}",
                reservation.max_length
            ))
            .with_offset(reservation.offset as u64));
    }
    if final_length == 0 && !reservation.meta_data {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("empty data records cannot be committed")
            .with_offset(reservation.offset as u64));
    }
    let ready = ready_word(final_length, reservation.meta_data);
    if region.compare_and_swap_u32(reservation.offset, reservation.word(), ready)? {
        return Ok(());
    }
    let found = region.read_volatile_u32(reservation.offset)?;
    Err(Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "reservation lost before commit (header now {:?})",
            state(found)
        ))
        .with_offset(reservation.offset as u64))
}

/// Zeroes the reserved payload, then resets the header to `NOT_INITIALIZED`.
pub fn rollback(region: &MappedRegion, reservation: &Reservation) -> Result<()> {
    let payload = reservation.payload_offset();
    let end = (payload + reservation.max_length).min(region.limit());
    region.zero_range(payload, end, true)?;
    region.write_ordered_u32(reservation.offset, NOT_INITIALIZED)
}

/// Rebuilds the reservation left at `offset` by a writer that no longer holds the lock.
pub fn abandoned_reservation(region: &MappedRegion, offset: usize) -> Result<Option<Reservation>> {
    let word = region.read_volatile_u32(offset)?;
    if !is_working(word) {
        return Ok(None);
    }
    Ok(Some(Reservation {
        offset,
        max_length: length(word),
        meta_data: word & META_DATA != 0,
    }))
}
