//! The public, caller-facing surface: an explicit [`Allocator`] handle
//! for callers who want to own their state, plus a process-wide
//! singleton exposed as free functions for callers who just want a
//! global `malloc`/`free` pair.
use std::ptr::NonNull;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::warn;

use crate::page_allocator::PageAllocator;
use crate::region::Region;
use crate::stats::{self, Stats};
use crate::zone_allocator::ZoneAllocator;

/// Owns one Page Allocator and one Zone Allocator pair.
///
/// Cheap to construct; does nothing useful until [`Allocator::init`]
/// (or [`Allocator::init_single_region`]) succeeds.
pub struct Allocator {
    pages: PageAllocator,
    zones: ZoneAllocator,
    initialized: bool,
}

// SAFETY: `Allocator`'s raw pointers are only ever dereferenced through
// `&mut self` methods, and the sole cross-thread use (`GLOBAL`) always
// accesses the allocator through a `Mutex`, which serializes all access.
unsafe impl Send for Allocator {}

impl Default for Allocator {
    fn default() -> Self {
        Allocator {
            pages: PageAllocator::new(),
            zones: ZoneAllocator::new(),
            initialized: false,
        }
    }
}

impl Allocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Normalizes `regions`, self-hosts the page-descriptor array, and
    /// bootstraps the zone-descriptor class. Returns `false` (and logs
    /// a warning) on any configuration or bootstrap failure, leaving
    /// the allocator cleared.
    pub fn init(&mut self, regions: &[Region], page_size: usize) -> bool {
        self.pages.clear();
        self.zones.clear();
        self.initialized = false;

        if let Err(e) = self.pages.init(regions, page_size) {
            warn!("page allocator init failed: {}", e);
            return false;
        }

        if let Err(e) = self.zones.init(&mut self.pages, page_size) {
            warn!("zone allocator bootstrap failed: {}", e);
            self.pages.clear();
            return false;
        }

        self.initialized = true;
        true
    }

    /// Convenience wrapper over [`Self::init`] for a single contiguous region.
    pub fn init_single_region(&mut self, start: usize, end: usize, page_size: usize) -> bool {
        if end <= start {
            warn!("init_single_region called with an empty or inverted range");
            return false;
        }

        let regions = [
            Region {
                address: start,
                size: end - start,
            },
            Region { address: 0, size: 0 },
        ];
        self.init(&regions, page_size)
    }

    /// Resets both tiers to the uninitialized state.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.zones.clear();
        self.initialized = false;
    }

    /// Returns `None` for a zero-size request or when uninitialized.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.initialized {
            return None;
        }
        let addr = self.zones.allocate(&mut self.pages, size)?;
        NonNull::new(addr as *mut u8)
    }

    /// `None` is tolerated and does nothing.
    pub fn release(&mut self, ptr: Option<NonNull<u8>>) {
        if !self.initialized {
            return;
        }
        if let Some(ptr) = ptr {
            self.zones.release(&mut self.pages, ptr.as_ptr() as usize);
        }
    }

    pub fn stats(&self) -> Stats {
        stats::aggregate(&self.pages.stats(), &self.zones.stats())
    }
}

lazy_static! {
    static ref GLOBAL: Mutex<Allocator> = Mutex::new(Allocator::new());
}

/// Monotonically increasing human-readable version tag.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn init(regions: &[Region], page_size: usize) -> bool {
    GLOBAL.lock().unwrap().init(regions, page_size)
}

pub fn init_single_region(start: usize, end: usize, page_size: usize) -> bool {
    GLOBAL.lock().unwrap().init_single_region(start, end, page_size)
}

pub fn clear() {
    GLOBAL.lock().unwrap().clear();
}

pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    GLOBAL.lock().unwrap().allocate(size)
}

pub fn release(ptr: Option<NonNull<u8>>) {
    GLOBAL.lock().unwrap().release(ptr);
}

pub fn stats() -> Stats {
    GLOBAL.lock().unwrap().stats()
}
