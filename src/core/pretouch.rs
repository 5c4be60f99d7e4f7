// Pre-faults pages ahead of the write position so appends do not pay for page faults.
// Takes no lock: touching a zero word with CAS(0, 0) never changes data.
use tracing::trace;

use crate::core::error::Result;
use crate::core::store::CycleStore;

const FALLBACK_PAGE_SIZE: usize = 4096;

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

#[derive(Debug)]
pub struct Pretoucher {
    ahead: usize,
    page_size: usize,
    cycle: Option<u32>,
    touched_until: usize,
}

impl Pretoucher {
    pub fn new(ahead: usize) -> Self {
        Self {
            ahead,
            page_size: page_size(),
            cycle: None,
            touched_until: 0,
        }
    }

    pub fn touched_until(&self) -> usize {
        self.touched_until
    }

    /// Touches every page start in `[write_position, write_position + ahead)` not touched before.
    /// Returns the number of pages touched; repeated calls with no progress touch nothing.
    pub fn execute(&mut self, store: &CycleStore) -> Result<usize> {
        if self.cycle != Some(store.cycle()) {
            self.cycle = Some(store.cycle());
            self.touched_until = 0;
        }
        let position = store.write_position()?;
        let region = store.region();
        let end = position
            .saturating_add(self.ahead)
            .min(region.capacity());
        let first_page = (position / self.page_size) * self.page_size;
        let mut page = first_page.max(self.touched_until);
        let mut touched = 0usize;
        while page < end {
            region.compare_and_swap_u32(page, 0, 0)?;
            touched += 1;
            page += self.page_size;
        }
        if page > self.touched_until {
            self.touched_until = page;
        }
        if touched > 0 {
            trace!(cycle = store.cycle(), touched, until = self.touched_until, "pretouched pages");
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::{Pretoucher, page_size};
    use crate::core::store::{CycleStore, StoreLayout};

    #[test]
    fn pretouch_is_idempotent_until_position_moves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let page = page_size();
        let layout = StoreLayout {
            capacity: (page * 16) as u64,
            index_count: 8,
            index_spacing: 4,
            sequence_bits: 32,
        };
        let store = CycleStore::open(&dir.path().join("c.lgs"), 1, &layout, true)
            .expect("open")
            .expect("store");

        let mut pretoucher = Pretoucher::new(page * 4);
        let first = pretoucher.execute(&store).expect("touch");
        assert!(first >= 4);
        assert_eq!(pretoucher.execute(&store).expect("again"), 0);

        store
            .set_write_position(page * 2 + 16)
            .expect("advance");
        assert_eq!(pretoucher.execute(&store).expect("more"), 2);
        assert_eq!(
            store.region().read_volatile_u32(page * 3).expect("word"),
            0,
            "touching must not change data"
        );
    }

    #[test]
    fn pretouch_stops_at_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let page = page_size();
        let layout = StoreLayout {
            capacity: (page * 2) as u64,
            index_count: 8,
            index_spacing: 4,
            sequence_bits: 32,
        };
        let store = CycleStore::open(&dir.path().join("c.lgs"), 1, &layout, true)
            .expect("open")
            .expect("store");
        let mut pretoucher = Pretoucher::new(page * 100);
        assert_eq!(pretoucher.execute(&store).expect("touch"), 2);
        assert_eq!(pretoucher.touched_until(), page * 2);
    }
}
