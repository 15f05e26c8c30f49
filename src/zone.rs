//! A zone: one page subdivided into fixed-size chunks, plus the
//! free-chunk stack carved out of the chunks themselves.
use std::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::list::{IntrusiveNode, Links};

/// Singly-linked node overlaid on a free chunk's leading bytes.
#[repr(C)]
struct ChunkNode {
    next: Option<NonNull<ChunkNode>>,
}

/// One page's worth of same-size chunks and their free-chunk stack.
///
/// `links` lets a zone sit in its class's doubly-linked list (see
/// [`crate::zone_allocator::ZoneAllocator`]); everything else is
/// scalar bookkeeping about the backing page.
#[repr(C)]
pub struct Zone {
    links: Links<Zone>,
    page_address: usize,
    chunk_size: usize,
    total_chunks: usize,
    free_chunks: usize,
    free_list: Option<NonNull<ChunkNode>>,
    valid: bool,
}

const_assert_eq!(std::mem::size_of::<Zone>(), 64);

unsafe impl IntrusiveNode for Zone {
    fn links(&self) -> &Links<Zone> {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links<Zone> {
        &mut self.links
    }
}

impl Default for Zone {
    fn default() -> Self {
        Zone {
            links: Links::new(),
            page_address: 0,
            chunk_size: 0,
            total_chunks: 0,
            free_chunks: 0,
            free_list: None,
            valid: false,
        }
    }
}

impl Zone {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn page_address(&self) -> usize {
        self.page_address
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn free_chunks(&self) -> usize {
        self.free_chunks
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_fully_free(&self) -> bool {
        self.free_chunks == self.total_chunks
    }

    /// Carves `page_address..page_address + page_size` into
    /// `page_size / chunk_size` chunks and stacks them all as free.
    ///
    /// # Safety
    ///
    /// `page_address` must designate `page_size` bytes of memory the
    /// caller exclusively owns; no other reference into that span may
    /// be alive across this call.
    pub unsafe fn init(&mut self, page_address: usize, chunk_size: usize, page_size: usize) {
        debug_assert!(chunk_size >= std::mem::size_of::<ChunkNode>());
        debug_assert!(page_size % chunk_size == 0);

        self.page_address = page_address;
        self.chunk_size = chunk_size;
        self.total_chunks = page_size / chunk_size;
        self.free_chunks = 0;
        self.free_list = None;
        self.valid = true;

        for i in 0..self.total_chunks {
            let addr = page_address + i * chunk_size;
            push_free(addr, &mut self.free_list);
            self.free_chunks += 1;
        }
    }

    pub fn clear(&mut self) {
        *self = Default::default();
    }

    /// Pops and returns the address of a free chunk, or `None` if the
    /// zone has none.
    ///
    /// # Safety
    ///
    /// Must not be called concurrently with another mutation of this
    /// zone's free list.
    pub unsafe fn take_chunk(&mut self) -> Option<usize> {
        let addr = pop_free(&mut self.free_list)?;
        self.free_chunks -= 1;
        Some(addr)
    }

    /// Pushes `addr` back onto the free-chunk stack.
    ///
    /// # Safety
    ///
    /// `addr` must be a chunk of this zone that is currently taken.
    pub unsafe fn give_chunk(&mut self, addr: usize) {
        debug_assert!(self.is_valid_chunk(addr));
        push_free(addr, &mut self.free_list);
        self.free_chunks += 1;
    }

    /// Linear scan over this zone's chunk slots for exact address equality;
    /// rejects pointers that fall mid-chunk.
    pub fn is_valid_chunk(&self, addr: usize) -> bool {
        for i in 0..self.total_chunks {
            if self.page_address + i * self.chunk_size == addr {
                return true;
            }
        }
        false
    }
}

unsafe fn push_free(addr: usize, free_list: &mut Option<NonNull<ChunkNode>>) {
    let node_ptr = addr as *mut ChunkNode;
    node_ptr.write(ChunkNode { next: *free_list });
    *free_list = NonNull::new(node_ptr);
}

unsafe fn pop_free(free_list: &mut Option<NonNull<ChunkNode>>) -> Option<usize> {
    let node = (*free_list)?;
    *free_list = node.as_ref().next;
    Some(node.as_ptr() as usize)
}
