//! Purpose: Bounds-checked, ordered and atomic access to a shared memory-mapped file.
//! Exports: `MappedRegion`, `Primitive`.
//! Role: The only module that dereferences mapped memory; every other layer goes through it.
//! Invariants: `start <= position <= limit <= capacity` holds after every call.
//! Invariants: A failed bounds check leaves `position` untouched.
//! Invariants: Slices share the mapping through an `Arc`; the mapping is unmapped with the last view.
//! Invariants: Multi-byte values are little endian on disk, atomics included.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapRaw;

use crate::core::error::{Error, ErrorKind, Result};

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width values that can be copied in and out of a region.
pub trait Primitive: Copy + sealed::Sealed {
    const SIZE: usize;

    /// # Safety
    /// `src` must be valid for reads of `Self::SIZE` bytes.
    unsafe fn load(src: *const u8) -> Self;

    /// # Safety
    /// `dst` must be valid for writes of `Self::SIZE` bytes.
    unsafe fn store(self, dst: *mut u8);
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const SIZE: usize = size_of::<$ty>();

                unsafe fn load(src: *const u8) -> Self {
                    // SAFETY: the caller guarantees `src` covers `SIZE` readable bytes.
                    let bytes = unsafe { ptr::read_unaligned(src.cast::<[u8; size_of::<$ty>()]>()) };
                    <$ty>::from_le_bytes(bytes)
                }

                unsafe fn store(self, dst: *mut u8) {
                    // SAFETY: the caller guarantees `dst` covers `SIZE` writable bytes.
                    unsafe {
                        ptr::write_unaligned(dst.cast::<[u8; size_of::<$ty>()]>(), self.to_le_bytes())
                    }
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

struct Mapping {
    raw: MmapRaw,
    path: PathBuf,
}

/// A view over a mapped file.
///
/// Offsets are absolute within the file. Cloning or slicing produces another view over the same
/// mapping with its own cursor; writes through any view are visible to every other view and to
/// other processes mapping the same file.
pub struct MappedRegion {
    mapping: Arc<Mapping>,
    start: usize,
    capacity: usize,
    position: usize,
    limit: usize,
}

impl MappedRegion {
    pub fn map(file: &File, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = MmapRaw::map_raw(file)
            .map_err(|err| Error::io(err).with_message("mmap failed").with_path(&path))?;
        let capacity = raw.len();
        Ok(Self {
            mapping: Arc::new(Mapping { raw, path }),
            start: 0,
            capacity,
            position: 0,
            limit: capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.mapping.path
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Number of live views sharing this mapping.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.mapping)
    }

    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position < self.start || position > self.limit {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message(format!(
                    "position outside [{}, {}]",
                    self.start, self.limit
                ))
                .with_offset(position as u64));
        }
        self.position = position;
        Ok(())
    }

    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit < self.position || limit > self.capacity {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message(format!(
                    "limit outside [{}, {}]",
                    self.position, self.capacity
                ))
                .with_offset(limit as u64));
        }
        self.limit = limit;
        Ok(())
    }

    /// New view over `[offset, offset + length)` sharing this mapping.
    pub fn slice(&self, offset: usize, length: usize) -> Result<MappedRegion> {
        let end = offset.checked_add(length);
        let valid = offset >= self.start
            && offset < self.capacity
            && end.is_some_and(|end| end > offset && end <= self.capacity);
        if !valid {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message(format!(
                    "slice of {length} bytes outside [{}, {})",
                    self.start, self.capacity
                ))
                .with_offset(offset as u64));
        }
        let capacity = offset + length;
        Ok(MappedRegion {
            mapping: Arc::clone(&self.mapping),
            start: offset,
            capacity,
            position: offset,
            limit: capacity,
        })
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        let in_bounds = offset >= self.start
            && offset
                .checked_add(len)
                .is_some_and(|end| end <= self.limit);
        if !in_bounds {
            return Err(Error::new(ErrorKind::Bounds)
                .with_message(format!(
                    "{len} bytes outside [{}, {})",
                    self.start, self.limit
                ))
                .with_path(self.path())
                .with_offset(offset as u64));
        }
        Ok(())
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers validated `offset` against `capacity`, which never exceeds the mapping.
        unsafe { self.mapping.raw.as_mut_ptr().add(offset) }
    }

    fn check_aligned(&self, offset: usize, align: usize) -> Result<()> {
        if (self.ptr(offset) as usize) % align != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("atomic access requires {align}-byte alignment"))
                .with_offset(offset as u64));
        }
        Ok(())
    }

    pub fn read<T: Primitive>(&self, offset: usize) -> Result<T> {
        self.check(offset, T::SIZE)?;
        // SAFETY: bounds validated above.
        Ok(unsafe { T::load(self.ptr(offset)) })
    }

    pub fn write<T: Primitive>(&self, offset: usize, value: T) -> Result<()> {
        self.check(offset, T::SIZE)?;
        // SAFETY: bounds validated above.
        unsafe { value.store(self.ptr(offset)) };
        Ok(())
    }

    /// Debug-checked read for hot paths that validated the range once up front.
    ///
    /// # Safety
    /// `[offset, offset + T::SIZE)` must lie inside `[start, limit)`.
    pub unsafe fn read_unchecked<T: Primitive>(&self, offset: usize) -> T {
        debug_assert!(self.check(offset, T::SIZE).is_ok(), "unchecked read out of bounds");
        // SAFETY: guaranteed by the caller.
        unsafe { T::load(self.ptr(offset)) }
    }

    /// # Safety
    /// `[offset, offset + T::SIZE)` must lie inside `[start, limit)`.
    pub unsafe fn write_unchecked<T: Primitive>(&self, offset: usize, value: T) {
        debug_assert!(self.check(offset, T::SIZE).is_ok(), "unchecked write out of bounds");
        // SAFETY: guaranteed by the caller.
        unsafe { value.store(self.ptr(offset)) }
    }

    fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check(offset, 4)?;
        self.check_aligned(offset, align_of::<AtomicU32>())?;
        // SAFETY: in bounds, aligned, and the mapping outlives the returned borrow of `self`.
        Ok(unsafe { AtomicU32::from_ptr(self.ptr(offset).cast::<u32>()) })
    }

    fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        self.check(offset, 8)?;
        self.check_aligned(offset, align_of::<AtomicU64>())?;
        // SAFETY: in bounds, aligned, and the mapping outlives the returned borrow of `self`.
        Ok(unsafe { AtomicU64::from_ptr(self.ptr(offset).cast::<u64>()) })
    }

    /// Acquire load; pairs with `write_ordered_u32` on another thread or process.
    pub fn read_volatile_u32(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le(self.atomic_u32(offset)?.load(Ordering::Acquire)))
    }

    pub fn read_volatile_u64(&self, offset: usize) -> Result<u64> {
        Ok(u64::from_le(self.atomic_u64(offset)?.load(Ordering::Acquire)))
    }

    /// Release store: everything written before it is visible to an acquiring reader of this word.
    pub fn write_ordered_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.atomic_u32(offset)?.store(value.to_le(), Ordering::Release);
        Ok(())
    }

    pub fn write_ordered_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.atomic_u64(offset)?.store(value.to_le(), Ordering::Release);
        Ok(())
    }

    pub fn compare_and_swap_u32(&self, offset: usize, expected: u32, value: u32) -> Result<bool> {
        Ok(self
            .atomic_u32(offset)?
            .compare_exchange(expected.to_le(), value.to_le(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    pub fn compare_and_swap_u64(&self, offset: usize, expected: u64, value: u64) -> Result<bool> {
        Ok(self
            .atomic_u64(offset)?
            .compare_exchange(expected.to_le(), value.to_le(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Clears `[start, end)`. With `only_if_non_zero` each word is read first and written only
    /// when dirty, so already-zero pages are not faulted in for writing.
    pub fn zero_range(&self, start: usize, end: usize, only_if_non_zero: bool) -> Result<()> {
        if end < start {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("zero range end {end} before start {start}")));
        }
        self.check(start, end - start)?;
        if !only_if_non_zero {
            // SAFETY: range validated above.
            unsafe { ptr::write_bytes(self.ptr(start), 0, end - start) };
            return Ok(());
        }

        let mut offset = start;
        while offset < end && offset % 8 != 0 {
            self.zero_byte_if_dirty(offset);
            offset += 1;
        }
        while offset + 8 <= end {
            // SAFETY: inside the validated range.
            unsafe {
                if u64::load(self.ptr(offset)) != 0 {
                    0u64.store(self.ptr(offset));
                }
            }
            offset += 8;
        }
        while offset < end {
            self.zero_byte_if_dirty(offset);
            offset += 1;
        }
        Ok(())
    }

    fn zero_byte_if_dirty(&self, offset: usize) {
        // SAFETY: only called inside a range validated by `zero_range`.
        unsafe {
            let ptr = self.ptr(offset);
            if ptr.read() != 0 {
                ptr.write(0);
            }
        }
    }

    pub fn read_bytes_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        // SAFETY: bounds validated above; `out` is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(self.ptr(offset), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    pub fn write_bytes_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: bounds validated above; `data` is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.ptr(offset), data.len()) };
        Ok(())
    }

    /// Borrowed view of mapped bytes. Only meaningful for ranges behind a `READY` header,
    /// which writers never touch again.
    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        // SAFETY: bounds validated above; lifetime tied to `self`, which keeps the mapping alive.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr(offset), len) })
    }

    /// # Safety
    /// The caller must hold the write lock and must not create overlapping mutable views.
    pub(crate) unsafe fn bytes_mut_at(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check(offset, len)?;
        // SAFETY: bounds validated above; exclusivity guaranteed by the caller.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr(offset), len) })
    }

    pub fn read_next<T: Primitive>(&mut self) -> Result<T> {
        let value = self.read::<T>(self.position)?;
        self.position += T::SIZE;
        Ok(value)
    }

    pub fn write_next<T: Primitive>(&mut self, value: T) -> Result<()> {
        self.write(self.position, value)?;
        self.position += T::SIZE;
        Ok(())
    }

    pub fn read_next_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        self.read_bytes_at(self.position, out)?;
        self.position += out.len();
        Ok(())
    }

    pub fn write_next_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.write_bytes_at(self.position, data)?;
        self.position += data.len();
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.mapping
            .raw
            .flush()
            .map_err(|err| Error::io(err).with_path(self.path()))
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        self.mapping
            .raw
            .flush_range(offset, len)
            .map_err(|err| Error::io(err).with_path(self.path()))
    }
}

impl Clone for MappedRegion {
    fn clone(&self) -> Self {
        Self {
            mapping: Arc::clone(&self.mapping),
            start: self.start,
            capacity: self.capacity,
            position: self.position,
            limit: self.limit,
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.mapping.path)
            .field("start", &self.start)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity)
            .finish()
    }
}
