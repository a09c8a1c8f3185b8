//! The implicit allocator: first fit over every block in the region.
//!
//! "Implicit" means there is no free list; the free blocks are only
//! discoverable by walking the block sequence from the region base, which
//! is exactly what allocation does. Freeing is a single flag flip and no
//! coalescing ever happens, so fragmentation is reclaimed only when a
//! caller grows back into a block via [`reallocate`](ImplicitHeap::reallocate).
use crate::header::{round_up, Header};
use crate::region::{BlockOffset, Region};
use crate::{breakpoint, InitError, ALIGNMENT, MAX_REQUEST_SIZE};

use core::ptr::NonNull;

use log::{debug, error};

/// A heap with no free-block bookkeeping beyond the headers themselves.
///
/// Allocation walks all blocks in address order and takes the first free
/// block that is large enough. Only the last block of the region is ever
/// split; a fit in the middle of the region occupies the whole block.
pub struct ImplicitHeap {
    region: Region,
    block_count: usize,
    bytes_in_use: usize,
}

impl ImplicitHeap {
    /// Take over the region `[base, base + capacity)` and format it as one
    /// free block.
    ///
    /// # Errors
    /// Fails with [`InitError::RegionTooSmall`] if the region cannot hold a
    /// single header, and with [`InitError::Misaligned`] if `base` or
    /// `capacity` is not a multiple of [`ALIGNMENT`].
    ///
    /// # Safety
    /// The region must be valid for reads and writes for the lifetime of
    /// the heap, and nothing else may access it during that time.
    pub unsafe fn init(base: NonNull<u8>, capacity: usize) -> Result<Self, InitError> {
        if base.as_ptr() as usize % ALIGNMENT != 0 || capacity % ALIGNMENT != 0 {
            return Err(InitError::Misaligned);
        }
        if capacity < Header::SIZE {
            return Err(InitError::RegionTooSmall);
        }
        // SAFETY: validity and exclusivity of the region are the caller's
        // contract, forwarded verbatim.
        let region = unsafe { Region::new(base, capacity) };
        let mut heap = Self {
            region,
            block_count: 0,
            bytes_in_use: 0,
        };
        heap.reset();
        Ok(heap)
    }

    /// Reset the heap to its initial empty state.
    ///
    /// All outstanding payload pointers are invalidated.
    pub fn reset(&mut self) {
        let size = self.region.capacity() - Header::SIZE;
        let first = self.region.block_at(0);
        self.region.set_header(first, Header::free(size));
        self.block_count = 1;
        self.bytes_in_use = 0;
    }

    /// Allocate `requested` bytes and return the payload address.
    ///
    /// Returns `None` for a zero-sized request, a request beyond
    /// [`MAX_REQUEST_SIZE`] or when no free block fits.
    pub fn allocate(&mut self, requested: usize) -> Option<NonNull<u8>> {
        let block = self.allocate_block(requested)?;
        Some(self.region.payload_ptr(block))
    }

    fn allocate_block(&mut self, requested: usize) -> Option<BlockOffset> {
        if requested == 0 || requested > MAX_REQUEST_SIZE {
            return None;
        }
        let need = round_up(requested, ALIGNMENT);

        let block = self.region.blocks().find(|&block| {
            let header = self.region.header(block);
            !header.is_used() && header.size() >= need
        })?;

        let size = self.region.header(block).size();
        if self.region.is_last(block) && size - need >= Header::SIZE {
            // shrink the last block to the request and append a trailing
            // free header over the remainder
            self.region.set_header(block, Header::used(need));
            let tail = self.region.block_at(block.payload_offset() + need);
            self.region
                .set_header(tail, Header::free(size - need - Header::SIZE));
            self.block_count += 1;
            self.bytes_in_use += need;
        } else {
            self.region.set_header(block, Header::used(size));
            self.bytes_in_use += size;
        }
        Some(block)
    }

    /// Release the block behind a payload pointer; null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by
    /// [`allocate`](Self::allocate)/[`reallocate`](Self::reallocate) on this
    /// heap and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: `payload` stems from this heap per the caller's contract.
        let block = unsafe { self.region.block_of_payload(payload) };
        let header = self.region.header(block);
        self.region.set_header(block, header.into_free());
        self.bytes_in_use -= header.size();
    }

    /// Resize the allocation behind `old`, moving it if necessary.
    ///
    /// A null `old` behaves like [`allocate`](Self::allocate); a zero
    /// `new_size` frees the block and returns `None`. If the block is
    /// already large enough the pointer is returned unchanged. On
    /// allocation failure `None` is returned and the old block stays valid.
    ///
    /// # Safety
    /// Same contract as [`free`](Self::free) for `old`.
    pub unsafe fn reallocate(&mut self, old: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(old) else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            // SAFETY: the caller's contract on `old` is exactly the `free`
            // contract.
            unsafe { self.free(old.as_ptr()) };
            return None;
        }
        // SAFETY: `old` stems from this heap per the caller's contract.
        let block = unsafe { self.region.block_of_payload(old) };
        let size = self.region.header(block).size();
        if size >= new_size {
            return Some(old);
        }

        let moved = self.allocate_block(new_size)?;
        self.region.copy_payload(block, moved, size);
        // SAFETY: `old` is still allocated on this heap; see above.
        unsafe { self.free(old.as_ptr()) };
        Some(self.region.payload_ptr(moved))
    }

    /// Check every heap invariant; log and return `false` on a violation.
    ///
    /// Confirms that the blocks tile the region exactly, that the block
    /// count matches the walk and that the in-use byte counter matches the
    /// sum of in-use payloads. Trips [`breakpoint`] before reporting.
    pub fn validate(&self) -> bool {
        let mut blocks = 0_usize;
        let mut tiled = 0_usize;
        let mut used_bytes = 0_usize;
        for block in self.region.blocks() {
            blocks += 1;
            let header = self.region.header(block);
            tiled += Header::SIZE + header.size();
            if header.is_used() {
                used_bytes += header.size();
            }
        }

        if blocks != self.block_count {
            error!(
                "heap corrupt: walked {blocks} blocks, bookkeeping says {}",
                self.block_count
            );
            breakpoint();
            return false;
        }
        if tiled != self.region.capacity() {
            error!(
                "heap corrupt: blocks tile {tiled} of {} region bytes",
                self.region.capacity()
            );
            breakpoint();
            return false;
        }
        if used_bytes != self.bytes_in_use {
            error!(
                "heap corrupt: in-use payloads sum to {used_bytes}, counter says {}",
                self.bytes_in_use
            );
            breakpoint();
            return false;
        }
        true
    }

    /// Log the block table for debugging.
    pub fn dump(&self) {
        debug!(
            "heap of {} bytes, {} blocks, {} payload bytes in use",
            self.region.capacity(),
            self.block_count,
            self.bytes_in_use
        );
        for (index, block) in self.region.blocks().enumerate() {
            debug!(
                "block {index} at {:#06x}: {:?}",
                block.as_usize(),
                self.region.header(block)
            );
        }
    }

    /// The total number of bytes in the managed region.
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// The current number of blocks tiling the region.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// The number of payload bytes currently handed out to callers.
    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }
}
