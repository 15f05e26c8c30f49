//! The buddy-style Page Allocator: carves caller-supplied [`Region`]s
//! into fixed-size pages, self-hosts its own descriptor array inside
//! one of those regions, and serves/coalesces runs of pages.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

use std::ptr::NonNull;

use crate::list::{add_to_list, next as list_next, remove_from_list};
use crate::page::{group_index, init_group, join_group, split_group, Page};
use crate::region::{normalize, Region, RegionInfo};
use crate::util;

/// Caller regions are capped at 8, zero-terminated.
pub const MAX_REGIONS: usize = 8;
/// Smallest page size the allocator accepts.
pub const MIN_PAGE_SIZE: usize = 128;
/// `groupIndex` never exceeds this; see [`page::group_index`].
const FREE_LIST_BUCKETS: usize = 20;

/// Snapshot of the Page Allocator's own bookkeeping, used to compute
/// the allocator-wide aggregate stats.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageAllocatorStats {
    pub total_memory_size: usize,
    pub effective_memory_size: usize,
    pub user_memory_size: usize,
    pub free_memory_size: usize,
    pub page_size: usize,
    pub total_pages_count: usize,
    pub reserved_pages_count: usize,
    pub free_pages_count: usize,
}

pub struct PageAllocator {
    page_size: usize,
    regions: [RegionInfo; MAX_REGIONS],
    regions_count: usize,
    free_lists: [Option<NonNull<Page>>; FREE_LIST_BUCKETS],
    total_pages_count: usize,
    reserved_pages_count: usize,
    free_pages_count: usize,
    total_memory_size: usize,
    effective_memory_size: usize,
}

impl Default for PageAllocator {
    fn default() -> Self {
        PageAllocator {
            page_size: 0,
            regions: [RegionInfo::default(); MAX_REGIONS],
            regions_count: 0,
            free_lists: [None; FREE_LIST_BUCKETS],
            total_pages_count: 0,
            reserved_pages_count: 0,
            free_pages_count: 0,
            total_memory_size: 0,
            effective_memory_size: 0,
        }
    }
}

/// Sets the `used` bit on `count` consecutive descriptors starting at `page`.
///
/// # Safety
///
/// `page` must be the head of `count` contiguous, valid descriptors.
unsafe fn mark_used(page: NonNull<Page>, count: usize, used: bool) {
    let mut cursor = page;
    for i in 0..count {
        cursor.as_mut().set_used(used);
        if i + 1 < count {
            cursor = Page::next_sibling(cursor);
        }
    }
}

impl PageAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn clear(&mut self) {
        *self = Default::default();
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn free_pages_count(&self) -> usize {
        self.free_pages_count
    }

    /// Normalizes `regions`, chooses a region to host the descriptor
    /// array, and initializes the remaining pages of every region as
    /// free groups.
    #[requires(util::is_power_of_2(page_size) && page_size >= MIN_PAGE_SIZE,
               "page size must be a power of two no smaller than MIN_PAGE_SIZE")]
    pub fn init(&mut self, regions: &[Region], page_size: usize) -> Result<(), &'static str> {
        if !util::is_power_of_2(page_size) || page_size < MIN_PAGE_SIZE {
            return Err("page size must be a power of two >= 128");
        }

        let mut infos = [RegionInfo::default(); MAX_REGIONS];
        let mut infos_count = 0usize;
        let mut seen = 0usize;

        for region in regions {
            if region.is_terminator() {
                break;
            }
            seen += 1;
            if seen > MAX_REGIONS {
                return Err("too many regions");
            }
            if let Ok(info) = normalize(region, page_size) {
                infos[infos_count] = info;
                infos_count += 1;
            }
        }

        if infos_count == 0 {
            return Err("no usable region");
        }

        let total_pages_count: usize = infos[..infos_count].iter().map(|i| i.page_count).sum();
        let descriptor_bytes = total_pages_count * std::mem::size_of::<Page>();
        let desc_pages = (descriptor_bytes + page_size - 1) / page_size;

        let mut chosen: Option<usize> = None;
        for (i, info) in infos[..infos_count].iter().enumerate() {
            if info.page_count < desc_pages {
                continue;
            }
            chosen = match chosen {
                None => Some(i),
                Some(best) if info.aligned_size < infos[best].aligned_size => Some(i),
                other => other,
            };
        }
        let chosen = chosen.ok_or("descriptor area larger than any region")?;

        let desc_base = infos[chosen].aligned_start as *mut Page;

        let mut offset = 0usize;
        for info in infos[..infos_count].iter_mut() {
            unsafe {
                let first = NonNull::new_unchecked(desc_base.add(offset));
                let last = NonNull::new_unchecked(desc_base.add(offset + info.page_count - 1));
                info.first_page = Some(first);
                info.last_page = Some(last);

                for k in 0..info.page_count {
                    let addr = info.aligned_start + k * page_size;
                    Page::init_at(NonNull::new_unchecked(desc_base.add(offset + k)), addr);
                }
            }
            offset += info.page_count;
        }

        self.page_size = page_size;
        self.total_pages_count = total_pages_count;
        self.reserved_pages_count = desc_pages;
        self.total_memory_size = infos[..infos_count].iter().map(|i| i.size).sum();
        self.effective_memory_size = infos[..infos_count].iter().map(|i| i.aligned_size).sum();
        self.regions = infos;
        self.regions_count = infos_count;
        self.free_lists = [None; FREE_LIST_BUCKETS];

        for (i, info) in self.regions[..infos_count].iter().enumerate() {
            let first = info.first_page.unwrap();
            let reserved_here = if i == chosen { desc_pages } else { 0 };

            unsafe {
                mark_used(first, reserved_here, true);
            }

            let free_count = info.page_count - reserved_here;
            if free_count > 0 {
                unsafe {
                    let group_first = NonNull::new_unchecked(first.as_ptr().add(reserved_here));
                    init_group(group_first, free_count);
                    add_to_list(group_first, &mut self.free_lists[group_index(free_count)]);
                }
            }
        }

        self.free_pages_count = total_pages_count - desc_pages;

        Ok(())
    }

    fn find_region(&self, addr: usize) -> Option<&RegionInfo> {
        self.regions[..self.regions_count]
            .iter()
            .find(|r| addr >= r.aligned_start && addr < r.aligned_end)
    }

    fn find_region_of_page(&self, page: NonNull<Page>) -> Option<usize> {
        let addr = page.as_ptr() as usize;
        self.regions[..self.regions_count]
            .iter()
            .position(|r| match (r.first_page, r.last_page) {
                (Some(first), Some(last)) => {
                    addr >= first.as_ptr() as usize && addr <= last.as_ptr() as usize
                }
                _ => false,
            })
    }

    /// Returns the descriptor covering `addr`, or `None` if `addr`
    /// falls outside every initialized region.
    pub fn get_page(&self, addr: usize) -> Option<NonNull<Page>> {
        let region = self.find_region(addr)?;
        let masked = addr & !(self.page_size - 1);
        if masked < region.aligned_start || masked >= region.aligned_end {
            return None;
        }
        let index = (masked - region.aligned_start) / self.page_size;
        let first = region.first_page?;
        unsafe { Some(NonNull::new_unchecked(first.as_ptr().add(index))) }
    }

    pub fn get_region(&self, addr: usize) -> Option<&RegionInfo> {
        self.find_region(addr)
    }

    /// Finds and removes the smallest free group of at least `n`
    /// pages, splits it, and returns the head of a `n`-page used run.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<Page>> {
        if n == 0 || n > self.free_pages_count {
            return None;
        }

        let start_bucket = group_index(n);
        for bucket in start_bucket..FREE_LIST_BUCKETS {
            let mut cursor = self.free_lists[bucket];
            while let Some(candidate) = cursor {
                let size = unsafe { candidate.as_ref() }.group_size();
                if size >= n {
                    let prefix;
                    unsafe {
                        remove_from_list(candidate, &mut self.free_lists[bucket]);
                        let (p, suffix) = split_group(candidate, n);
                        prefix = p;
                        if let Some(suffix) = suffix {
                            let suffix_size = suffix.as_ref().group_size();
                            add_to_list(suffix, &mut self.free_lists[group_index(suffix_size)]);
                        }
                        mark_used(prefix, n, true);
                    }
                    self.free_pages_count -= n;
                    return Some(prefix);
                }
                cursor = list_next(candidate);
            }
        }

        None
    }

    /// Frees `page` (the head of a run returned by [`Self::allocate`])
    /// and greedily coalesces it with free neighbors.
    ///
    /// # Safety
    ///
    /// `page` must be the head of a currently-allocated group
    /// previously returned by `allocate`.
    pub unsafe fn release(&mut self, page: NonNull<Page>) {
        let size = page.as_ref().group_size();
        mark_used(page, size, false);
        self.coalesce_release(page);
        self.free_pages_count += size;
    }

    unsafe fn coalesce_release(&mut self, mut g: NonNull<Page>) {
        let region_idx = self
            .find_region_of_page(g)
            .expect("released page must belong to a known region");

        loop {
            let region_first = self.regions[region_idx].first_page.unwrap();
            if g.as_ptr() == region_first.as_ptr() {
                break;
            }
            let above = Page::prev_sibling(g);
            if above.as_ref().is_used() {
                break;
            }
            let h_size = above.as_ref().group_size();
            let h_first = NonNull::new_unchecked(above.as_ptr().sub(h_size - 1));
            remove_from_list(h_first, &mut self.free_lists[group_index(h_size)]);
            g = join_group(h_first, g);
        }

        loop {
            let region_last = self.regions[region_idx].last_page.unwrap();
            let g_size = g.as_ref().group_size();
            let last = NonNull::new_unchecked(g.as_ptr().add(g_size - 1));
            if last.as_ptr() == region_last.as_ptr() {
                break;
            }
            let next = Page::next_sibling(last);
            if next.as_ref().is_used() {
                break;
            }
            let h_size = next.as_ref().group_size();
            remove_from_list(next, &mut self.free_lists[group_index(h_size)]);
            g = join_group(g, next);
        }

        let final_size = g.as_ref().group_size();
        add_to_list(g, &mut self.free_lists[group_index(final_size)]);
    }

    pub fn stats(&self) -> PageAllocatorStats {
        PageAllocatorStats {
            total_memory_size: self.total_memory_size,
            effective_memory_size: self.effective_memory_size,
            user_memory_size: self.effective_memory_size
                - self.reserved_pages_count * self.page_size,
            free_memory_size: self.free_pages_count * self.page_size,
            page_size: self.page_size,
            total_pages_count: self.total_pages_count,
            reserved_pages_count: self.reserved_pages_count,
            free_pages_count: self.free_pages_count,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn aligned_region(size: usize, align: usize) -> Region {
        let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Region {
            address: ptr as usize,
            size,
        }
    }

    #[test]
    fn s1_three_region_init_reserves_descriptor_pages() {
        let page_size = 256usize;
        let regions = [
            aligned_region(136960, page_size),
            aligned_region(22272, page_size),
            aligned_region(1024, page_size),
            Region { address: 0, size: 0 },
        ];

        let mut alloc = PageAllocator::new();
        alloc.init(&regions, page_size).expect("init should succeed");

        assert_eq!(alloc.total_pages_count, 626);
        // The 87-page region is the smallest that can host 626 descriptors.
        assert_eq!(alloc.reserved_pages_count, 79);

        let stats = alloc.stats();
        assert_eq!(stats.total_memory_size, 160256);
        assert_eq!(stats.reserved_pages_count * page_size, 20224);
        assert_eq!(stats.user_memory_size, 160256 - 20224);
        assert_eq!(stats.free_memory_size, stats.user_memory_size);
    }

    #[test]
    fn s2_single_region_init() {
        let page_size = 256usize;
        let region = aligned_region(136960, page_size);
        let regions = [region, Region { address: 0, size: 0 }];

        let mut alloc = PageAllocator::new();
        alloc.init(&regions, page_size).expect("init should succeed");
        assert_eq!(alloc.reserved_pages_count, 67);
        assert_eq!(alloc.reserved_pages_count * page_size, 17152);
    }

    #[test]
    fn s3_allocate_and_release_restores_free_count() {
        let page_size = 256usize;
        let regions = [
            aligned_region(136960, page_size),
            aligned_region(22272, page_size),
            aligned_region(1024, page_size),
            Region { address: 0, size: 0 },
        ];

        let mut alloc = PageAllocator::new();
        alloc.init(&regions, page_size).unwrap();
        let post_init_free = alloc.free_pages_count();

        let page = alloc.allocate(17).expect("17 pages should be available");
        assert_eq!(alloc.free_pages_count(), post_init_free - 17);

        unsafe {
            alloc.release(page);
        }
        assert_eq!(alloc.free_pages_count(), post_init_free);
    }

    #[test]
    fn release_coalesces_with_both_neighbors() {
        let page_size = 256usize;
        let region = aligned_region(64 * page_size, page_size);
        let regions = [region, Region { address: 0, size: 0 }];

        let mut alloc = PageAllocator::new();
        alloc.init(&regions, page_size).unwrap();
        let post_init_free = alloc.free_pages_count();

        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        let c = alloc.allocate(4).unwrap();

        unsafe {
            alloc.release(a);
            alloc.release(c);
            // Releasing the middle run should join with both now-free neighbors.
            alloc.release(b);
        }

        assert_eq!(alloc.free_pages_count(), post_init_free);
    }

    #[test]
    fn allocate_fails_when_nothing_fits() {
        let page_size = 256usize;
        let region = aligned_region(4 * page_size, page_size);
        let regions = [region, Region { address: 0, size: 0 }];

        let mut alloc = PageAllocator::new();
        alloc.init(&regions, page_size).unwrap();

        let free = alloc.free_pages_count();
        assert!(alloc.allocate(free).is_some());
        assert!(alloc.allocate(1).is_none());
    }

    #[test]
    fn get_page_is_none_outside_regions() {
        let page_size = 256usize;
        let region = aligned_region(4 * page_size, page_size);
        let regions = [region, Region { address: 0, size: 0 }];

        let mut alloc = PageAllocator::new();
        alloc.init(&regions, page_size).unwrap();

        assert!(alloc.get_page(0xdead_beef).is_none());
    }
}
