//! A two-tier allocator over caller-supplied memory regions: a buddy-style
//! Page Allocator that carves regions into fixed-size pages, and a
//! slab-style Zone Allocator that further subdivides pages into
//! power-of-two chunks for sub-page requests.
//!
//! Most callers want the process-wide facade: [`init`], [`allocate`],
//! [`release`], [`stats`], [`clear`]. Callers who want to own their
//! state explicitly (no global, no lock) can use [`Allocator`] instead.
mod list;
mod page;
mod page_allocator;
mod region;
mod stats;
mod util;
mod zone;
mod zone_allocator;

mod facade;

pub use facade::{allocate, clear, init, init_single_region, release, stats, version, Allocator};
pub use region::Region;
pub use stats::Stats;
