//! The slab-style Zone Allocator: serves sub-page allocations out of
//! zones (one page each, carved into equal-size chunks) and forwards
//! page-or-larger requests straight to the [`PageAllocator`].
use std::ptr::NonNull;

use crate::list::{add_to_list, next as list_next, remove_from_list};
use crate::page_allocator::PageAllocator;
use crate::util;
use crate::zone::Zone;

/// Chunk sizes 16, 32, 64, ..., 2048 -> 8 classes.
pub const CHUNK_CLASSES: usize = 8;
pub const MIN_CHUNK_SIZE: usize = 16;
pub const MAX_CHUNK_SIZE: usize = 2048;

/// Rounds `s` up to the chunk-size class that can hold it.
pub fn chunk_size(s: usize) -> usize {
    util::round_up_pow2(std::cmp::max(s, MIN_CHUNK_SIZE))
}

/// Maps a chunk size (a power of two, 16..=2048) to its class index.
pub fn zone_idx(cs: usize) -> usize {
    (util::log2_floor(cs) as usize) - 4
}

#[derive(Clone, Copy)]
struct ZoneClass {
    head: Option<NonNull<Zone>>,
    free_chunks: usize,
}

impl Default for ZoneClass {
    fn default() -> Self {
        ZoneClass {
            head: None,
            free_chunks: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ZoneAllocatorStats {
    pub used_memory_size: usize,
    pub reserved_memory_size: usize,
    pub free_memory_size: usize,
    pub allocated_memory_size: usize,
}

pub struct ZoneAllocator {
    initial_zone: Zone,
    classes: [ZoneClass; CHUNK_CLASSES],
    desc_class: usize,
    page_size: usize,
    zones_published: usize,
}

impl Default for ZoneAllocator {
    fn default() -> Self {
        ZoneAllocator {
            initial_zone: Zone::new(),
            classes: [ZoneClass::default(); CHUNK_CLASSES],
            desc_class: 0,
            page_size: 0,
            zones_published: 0,
        }
    }
}

impl ZoneAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn clear(&mut self) {
        *self = Default::default();
    }

    /// Embeds and publishes the initial zone (sized to host `Zone`
    /// descriptors themselves) on a page borrowed from `pages`.
    pub fn init(&mut self, pages: &mut PageAllocator, page_size: usize) -> Result<(), &'static str> {
        let desc_chunk_size = chunk_size(std::mem::size_of::<Zone>());
        let desc_class = zone_idx(desc_chunk_size);
        if desc_class >= CHUNK_CLASSES {
            return Err("zone descriptor size exceeds the largest chunk class");
        }

        let page = pages.allocate(1).ok_or("no page available for the initial zone")?;

        self.page_size = page_size;
        self.desc_class = desc_class;

        unsafe {
            self.initial_zone
                .init(page.as_ref().address(), desc_chunk_size, page_size);
            let initial = NonNull::from(&mut self.initial_zone);
            add_to_list(initial, &mut self.classes[desc_class].head);
        }
        self.classes[desc_class].free_chunks += self.initial_zone.free_chunks();
        self.zones_published = 1;

        Ok(())
    }

    fn get_free_zone(&self, idx: usize) -> Option<NonNull<Zone>> {
        let mut cursor = self.classes[idx].head;
        while let Some(zone) = cursor {
            if unsafe { zone.as_ref() }.free_chunks() > 0 {
                return Some(zone);
            }
            cursor = list_next(zone);
        }
        None
    }

    fn should_allocate_zone(&self, idx: usize) -> bool {
        let reserve = if idx == self.desc_class { 1 } else { 0 };
        self.classes[idx].free_chunks <= reserve
    }

    /// Mints a new zone of chunk size `cs` in class `idx`, recursing
    /// once into the descriptor class first if its own reserve would
    /// otherwise be exhausted.
    fn allocate_zone(&mut self, pages: &mut PageAllocator, cs: usize, idx: usize) -> Option<()> {
        if idx != self.desc_class && self.should_allocate_zone(self.desc_class) {
            let desc_cs = chunk_size(std::mem::size_of::<Zone>());
            self.allocate_zone(pages, desc_cs, self.desc_class)?;
        }

        let mut desc_zone = self.get_free_zone(self.desc_class)?;
        let desc_chunk = unsafe { desc_zone.as_mut().take_chunk() }?;
        self.classes[self.desc_class].free_chunks -= 1;

        let page = match pages.allocate(1) {
            Some(page) => page,
            None => {
                unsafe {
                    desc_zone.as_mut().give_chunk(desc_chunk);
                }
                self.classes[self.desc_class].free_chunks += 1;
                return None;
            }
        };

        let new_zone_ptr = desc_chunk as *mut Zone;
        unsafe {
            new_zone_ptr.write(Zone::new());
            (*new_zone_ptr).init(page.as_ref().address(), cs, self.page_size);
        }
        let new_zone = unsafe { NonNull::new_unchecked(new_zone_ptr) };
        unsafe {
            add_to_list(new_zone, &mut self.classes[idx].head);
        }
        self.classes[idx].free_chunks += unsafe { new_zone.as_ref() }.free_chunks();
        self.zones_published += 1;

        Some(())
    }

    /// Returns `None` for zero size. Forwards to the page layer for
    /// `size >= pageSize`, or when the rounded chunk size doesn't fit
    /// any of the fixed classes (past [`MAX_CHUNK_SIZE`]); otherwise
    /// serves a chunk from the matching class's zones.
    pub fn allocate(&mut self, pages: &mut PageAllocator, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }

        let cs = chunk_size(size);
        if size >= self.page_size || cs > MAX_CHUNK_SIZE {
            let n = (size + self.page_size - 1) / self.page_size;
            let page = pages.allocate(n)?;
            return Some(unsafe { page.as_ref() }.address());
        }

        let idx = zone_idx(cs);

        if self.should_allocate_zone(idx) {
            self.allocate_zone(pages, cs, idx)?;
        }

        let mut zone = self.get_free_zone(idx)?;
        let addr = unsafe { zone.as_mut().take_chunk() }?;
        self.classes[idx].free_chunks -= 1;
        Some(addr)
    }

    fn find_owning_zone(&self, addr: usize) -> Option<(usize, NonNull<Zone>)> {
        let candidate_page = addr & !(self.page_size - 1);
        for idx in 0..CHUNK_CLASSES {
            let mut cursor = self.classes[idx].head;
            while let Some(zone) = cursor {
                let z = unsafe { zone.as_ref() };
                if z.page_address() == candidate_page && z.is_valid_chunk(addr) {
                    return Some((idx, zone));
                }
                cursor = list_next(zone);
            }
        }
        None
    }

    fn is_initial_zone(&self, zone: NonNull<Zone>) -> bool {
        std::ptr::eq(zone.as_ptr() as *const Zone, &self.initial_zone as *const Zone)
    }

    fn retire_zone(&mut self, pages: &mut PageAllocator, idx: usize, mut zone: NonNull<Zone>) {
        unsafe {
            remove_from_list(zone, &mut self.classes[idx].head);
            self.classes[idx].free_chunks -= zone.as_ref().free_chunks();

            let page_addr = zone.as_ref().page_address();
            zone.as_mut().clear();
            self.zones_published -= 1;

            if let Some(page) = pages.get_page(page_addr) {
                pages.release(page);
            }

            let desc_addr = zone.as_ptr() as usize;
            self.release(pages, desc_addr);
        }
    }

    /// Returns the chunk or page group at `addr`. Unowned pointers
    /// fall through to the page layer, where a non-page-head address
    /// is silently ignored.
    pub fn release(&mut self, pages: &mut PageAllocator, addr: usize) {
        if let Some((idx, mut zone)) = self.find_owning_zone(addr) {
            unsafe {
                zone.as_mut().give_chunk(addr);
            }
            self.classes[idx].free_chunks += 1;

            if unsafe { zone.as_ref() }.is_fully_free() && !self.is_initial_zone(zone) {
                self.retire_zone(pages, idx, zone);
            }
        } else if let Some(page) = pages.get_page(addr) {
            unsafe {
                pages.release(page);
            }
        }
    }

    pub fn stats(&self) -> ZoneAllocatorStats {
        let used_memory_size = self.zones_published * self.page_size;
        let desc_chunk_size = chunk_size(std::mem::size_of::<Zone>());
        let reserved_memory_size = if self.zones_published == 0 {
            0
        } else {
            (self.zones_published - 1) * desc_chunk_size
        };

        let free_memory_size: usize = self
            .classes
            .iter()
            .map(|class| match class.head {
                Some(head) => unsafe { head.as_ref() }.chunk_size() * class.free_chunks,
                None => 0,
            })
            .sum();

        let allocated_memory_size = used_memory_size - reserved_memory_size - free_memory_size;

        ZoneAllocatorStats {
            used_memory_size,
            reserved_memory_size,
            free_memory_size,
            allocated_memory_size,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::region::Region;

    fn aligned_region(size: usize, align: usize) -> Region {
        let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Region {
            address: ptr as usize,
            size,
        }
    }

    fn init_pair(page_size: usize, region_pages: usize) -> (PageAllocator, ZoneAllocator) {
        let regions = [
            aligned_region(region_pages * page_size, page_size),
            Region { address: 0, size: 0 },
        ];
        let mut pages = PageAllocator::new();
        pages.init(&regions, page_size).unwrap();
        let mut zones = ZoneAllocator::new();
        zones.init(&mut pages, page_size).unwrap();
        (pages, zones)
    }

    #[test]
    fn chunk_size_and_zone_idx_examples() {
        assert_eq!(chunk_size(1), 16);
        assert_eq!(chunk_size(16), 16);
        assert_eq!(chunk_size(17), 32);
        assert_eq!(chunk_size(2048), 2048);
        assert_eq!(zone_idx(16), 0);
        assert_eq!(zone_idx(2048), 7);
    }

    #[test]
    fn small_allocation_comes_from_a_zone() {
        let (mut pages, mut zones) = init_pair(256, 64);

        let a = zones.allocate(&mut pages, 16).expect("should allocate");
        let b = zones.allocate(&mut pages, 16).expect("should allocate");
        assert_ne!(a, b);

        zones.release(&mut pages, a);
        zones.release(&mut pages, b);
    }

    #[test]
    fn s5_boundary_rounding() {
        let (mut pages, mut zones) = init_pair(256, 64);

        let a = zones.allocate(&mut pages, 6).unwrap();
        let b = zones.allocate(&mut pages, 16).unwrap();
        assert_eq!(a & 0xF, 0);
        assert_eq!(b & 0xF, 0);

        let c = zones.allocate(&mut pages, 17).unwrap();
        assert_eq!(c & 0x1F, 0);

        // size >= page_size always forwards to the page layer, even for
        // a size that would otherwise round into a defined chunk class.
        let free_before_512 = pages.free_pages_count();
        let d = zones.allocate(&mut pages, 512).unwrap();
        assert_eq!(pages.free_pages_count(), free_before_512 - 2);
        let _ = d;

        let free_before_2048 = pages.free_pages_count();
        let e = zones.allocate(&mut pages, 2048).unwrap();
        assert_eq!(pages.free_pages_count(), free_before_2048 - 8);
        let _ = e;

        let free_before_2049 = pages.free_pages_count();
        let big = zones.allocate(&mut pages, 2049).unwrap();
        assert_eq!(pages.free_pages_count(), free_before_2049 - 9);
        let _ = big;
    }

    #[test]
    fn oversize_page_never_indexes_past_the_chunk_class_table() {
        // With a large page size, requests between MAX_CHUNK_SIZE and
        // page_size must still fall through to the page layer rather
        // than rounding to a chunk size with no class slot.
        let (mut pages, mut zones) = init_pair(8192, 16);
        let addr = zones.allocate(&mut pages, 3000).expect("should allocate");
        zones.release(&mut pages, addr);
    }

    #[test]
    fn emptied_non_initial_zone_is_retired() {
        let (mut pages, mut zones) = init_pair(256, 64);
        let free_after_init = pages.free_pages_count();

        let mut taken = Vec::new();
        // Drain a full zone's worth of 64-byte chunks (256 / 64 == 4).
        for _ in 0..4 {
            taken.push(zones.allocate(&mut pages, 64).unwrap());
        }
        assert!(pages.free_pages_count() < free_after_init);

        for addr in taken {
            zones.release(&mut pages, addr);
        }

        assert_eq!(pages.free_pages_count(), free_after_init);
    }

    #[test]
    fn foreign_pointer_release_is_a_no_op() {
        let (mut pages, mut zones) = init_pair(256, 64);
        let free_before = pages.free_pages_count();

        zones.release(&mut pages, 0xdead_beef);

        assert_eq!(pages.free_pages_count(), free_before);
    }

    #[test]
    fn exhaustion_returns_none_and_leaves_stats_unchanged() {
        let (mut pages, mut zones) = init_pair(256, 4);
        let free = pages.free_pages_count();
        assert!(pages.allocate(free).is_some());

        let before = zones.stats();
        assert!(zones.allocate(&mut pages, 128).is_none());
        let after = zones.stats();
        assert_eq!(before.used_memory_size, after.used_memory_size);
        assert_eq!(before.allocated_memory_size, after.allocated_memory_size);
    }
}
