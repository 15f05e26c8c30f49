//! Caller-supplied memory regions and their normalized, page-aligned
//! form.
use std::ptr::NonNull;

use crate::page::Page;

/// One caller-supplied span of physical memory.  A `{address: 0, size: 0}`
/// entry terminates a region array passed to [`crate::page_allocator::PageAllocator::init`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub address: usize,
    pub size: usize,
}

impl Region {
    pub fn is_terminator(&self) -> bool {
        self.size == 0
    }
}

/// The normalized, page-aligned view of a [`Region`], plus the slice
/// of the page-descriptor array that describes its pages.
///
/// `first_page`/`last_page` are filled in by the Page Allocator once
/// it has chosen where to host the descriptor array; `normalize`
/// itself leaves them unset.
#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    pub start: usize,
    pub end: usize,
    pub aligned_start: usize,
    pub aligned_end: usize,
    pub page_count: usize,
    pub size: usize,
    pub aligned_size: usize,
    pub first_page: Option<NonNull<Page>>,
    pub last_page: Option<NonNull<Page>>,
}

impl Default for RegionInfo {
    fn default() -> Self {
        RegionInfo {
            start: 0,
            end: 0,
            aligned_start: 0,
            aligned_end: 0,
            page_count: 0,
            size: 0,
            aligned_size: 0,
            first_page: None,
            last_page: None,
        }
    }
}

/// Rounds `addr` up to the next multiple of `page_size`, failing if
/// the region (`region.address`, `region.size`) doesn't contain the
/// rounded value.
fn aligned_start(region: &Region, page_size: usize) -> Option<usize> {
    let mask = page_size - 1;
    let mut start = region.address & !mask;
    if start < region.address {
        start = start.checked_add(page_size)?;
    }

    let end = region.address.checked_add(region.size)?;
    if start > end {
        return None;
    }

    Some(start)
}

/// Rounds the region's end address down to a multiple of `page_size`.
fn aligned_end(region: &Region, page_size: usize) -> Option<usize> {
    let mask = page_size - 1;
    let end = region.address.checked_add(region.size)?;
    let aligned = end & !mask;
    if aligned < region.address {
        return None;
    }

    Some(aligned)
}

/// Normalizes a caller-supplied `region` to page-aligned bounds.
///
/// Fails if the region is smaller than one page, or if its aligned
/// span contains zero whole pages.  `page_size` must already be
/// validated as a power of two by the caller.
pub fn normalize(region: &Region, page_size: usize) -> Result<RegionInfo, &'static str> {
    if region.size < page_size {
        return Err("region is smaller than one page");
    }

    let mut info = RegionInfo {
        start: region.address,
        end: region
            .address
            .checked_add(region.size)
            .ok_or("region end overflows address space")?,
        ..Default::default()
    };

    info.aligned_start = aligned_start(region, page_size).ok_or("region rounds out of bounds")?;
    info.aligned_end = aligned_end(region, page_size).ok_or("region rounds out of bounds")?;

    if info.aligned_end <= info.aligned_start {
        return Err("region has zero aligned pages");
    }

    info.page_count = (info.aligned_end - info.aligned_start) / page_size;
    if info.page_count == 0 {
        return Err("region has zero aligned pages");
    }

    info.size = region.size;
    info.aligned_size = info.page_count * page_size;

    Ok(info)
}
