//! The explicit allocator: first fit over a free list, with coalescing.
//!
//! Free blocks are threaded onto a LIFO doubly-linked list living inside
//! their own payloads, so allocation only visits free blocks. Freeing
//! merges the block with its immediate right neighbor when that neighbor is
//! free; reallocation extends the merge to a whole chain of free right
//! neighbors before deciding whether the block can grow in place. Merging
//! to the left never happens: blocks carry no footer, so the left neighbor
//! could only be found by walking the region from the base.
//!
//! Every block of this variant, allocated or free, has a payload of at
//! least [`NODE_SIZE`] bytes so that it can rejoin the list when freed.
use crate::freelist::{FreeList, NODE_SIZE};
use crate::header::{round_up, Header};
use crate::region::{BlockOffset, Region};
use crate::{breakpoint, InitError, ALIGNMENT, MAX_REQUEST_SIZE};

use core::ptr::NonNull;

use log::{debug, error};

/// A heap that tracks its free blocks on an embedded free list.
pub struct ExplicitHeap {
    region: Region,
    list: FreeList,
    block_count: usize,
    bytes_in_use: usize,
}

impl ExplicitHeap {
    /// Take over the region `[base, base + capacity)` and format it as one
    /// free block holding the initial list node.
    ///
    /// # Errors
    /// Fails with [`InitError::RegionTooSmall`] if the region cannot hold a
    /// header plus one link node, and with [`InitError::Misaligned`] if
    /// `base` or `capacity` is not a multiple of [`ALIGNMENT`].
    ///
    /// # Safety
    /// The region must be valid for reads and writes for the lifetime of
    /// the heap, and nothing else may access it during that time.
    pub unsafe fn init(base: NonNull<u8>, capacity: usize) -> Result<Self, InitError> {
        if base.as_ptr() as usize % ALIGNMENT != 0 || capacity % ALIGNMENT != 0 {
            return Err(InitError::Misaligned);
        }
        if capacity < Header::SIZE + NODE_SIZE {
            return Err(InitError::RegionTooSmall);
        }
        // SAFETY: validity and exclusivity of the region are the caller's
        // contract, forwarded verbatim.
        let region = unsafe { Region::new(base, capacity) };
        let mut heap = Self {
            region,
            list: FreeList::new(),
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
        self.list = FreeList::new();
        self.list.push_front(&mut self.region, first);
    }

    /// Allocate `requested` bytes and return the payload address.
    ///
    /// Returns `None` for a zero-sized request, a request beyond
    /// [`MAX_REQUEST_SIZE`] or when no listed block fits.
    pub fn allocate(&mut self, requested: usize) -> Option<NonNull<u8>> {
        let block = self.allocate_block(requested)?;
        Some(self.region.payload_ptr(block))
    }

    fn allocate_block(&mut self, requested: usize) -> Option<BlockOffset> {
        if requested == 0 || requested > MAX_REQUEST_SIZE {
            return None;
        }
        let need = round_up(requested, ALIGNMENT);

        let block = self
            .list
            .iter(&self.region)
            .find(|&block| self.region.header(block).size() >= need)?;
        let size = self.region.header(block).size();
        self.list.remove(&mut self.region, block);

        // a block must be able to rejoin the list when freed, so it never
        // shrinks below the link-node footprint
        let claimed = need.max(NODE_SIZE);
        if self.region.is_last(block) && size >= claimed + Header::SIZE + NODE_SIZE {
            // split the tail off the last block and list the remainder
            self.region.set_header(block, Header::used(claimed));
            let tail = self.region.block_at(block.payload_offset() + claimed);
            self.region
                .set_header(tail, Header::free(size - claimed - Header::SIZE));
            self.block_count += 1;
            self.list.push_front(&mut self.region, tail);
            self.bytes_in_use += claimed;
        } else {
            self.region.set_header(block, Header::used(size));
            self.bytes_in_use += size;
        }
        Some(block)
    }

    /// Release the block behind a payload pointer; null is a no-op.
    ///
    /// If the immediate right neighbor is free it is absorbed into the
    /// freed block before the block goes onto the list. The left neighbor
    /// is never examined.
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
        let mut header = self.region.header(block).into_free();
        self.bytes_in_use -= header.size();

        if let Some(neighbor) = self.region.next_block(block) {
            let neighbor_header = self.region.header(neighbor);
            if !neighbor_header.is_used() {
                self.list.remove(&mut self.region, neighbor);
                header = Header::free(header.size() + Header::SIZE + neighbor_header.size());
                self.block_count -= 1;
            }
        }
        self.region.set_header(block, header);
        self.list.push_front(&mut self.region, block);
    }

    /// Resize the allocation behind `old`, growing in place if possible.
    ///
    /// A null `old` behaves like [`allocate`](Self::allocate); a zero
    /// `new_size` frees the block and returns `None`. If the block is
    /// already large enough the pointer is returned unchanged. Otherwise the
    /// chain of free right neighbors is absorbed; only if the block still
    /// falls short is the allocation moved. On allocation failure `None` is
    /// returned and the old block stays valid with its contents intact.
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
        if self.region.header(block).size() >= new_size {
            return Some(old);
        }

        // The block transits through the free state below, which overwrites
        // the first payload words with list links. Save them now; every exit
        // path restores them.
        let saved = self.region.payload_words(block);

        let mut header = self.region.header(block).into_free();
        self.bytes_in_use -= header.size();
        self.region.set_header(block, header);
        while let Some(neighbor) = self.region.next_block(block) {
            let neighbor_header = self.region.header(neighbor);
            if neighbor_header.is_used() {
                break;
            }
            self.list.remove(&mut self.region, neighbor);
            header = Header::free(header.size() + Header::SIZE + neighbor_header.size());
            self.region.set_header(block, header);
            self.block_count -= 1;
        }
        self.list.push_front(&mut self.region, block);
        header = header.into_used();
        self.region.set_header(block, header);

        let grown = header.size();
        if grown < new_size {
            // still short: move the allocation elsewhere
            let Some(moved) = self.allocate_block(new_size) else {
                // the block stays allocated, keeping whatever it absorbed
                self.list.remove(&mut self.region, block);
                self.region.set_payload_words(block, saved);
                self.bytes_in_use += grown;
                return None;
            };
            let links = self.region.payload_words(block);
            self.region.set_payload_words(block, saved);
            self.region.copy_payload(block, moved, grown);
            self.region.set_payload_words(block, links);
            self.region.set_header(block, header.into_free());
            Some(self.region.payload_ptr(moved))
        } else {
            let aligned = round_up(new_size, ALIGNMENT);
            let remainder = grown - aligned;
            if remainder <= NODE_SIZE + Header::SIZE {
                // the remainder could not hold a header plus a listable
                // free block; keep the surplus in the allocation
                self.list.remove(&mut self.region, block);
                self.region.set_payload_words(block, saved);
                self.bytes_in_use += grown;
            } else {
                self.region.set_header(block, Header::used(aligned));
                let tail = self.region.block_at(block.payload_offset() + aligned);
                self.region
                    .set_header(tail, Header::free(remainder - Header::SIZE));
                self.block_count += 1;
                self.list.remove(&mut self.region, block);
                self.list.push_front(&mut self.region, tail);
                self.region.set_payload_words(block, saved);
                self.bytes_in_use += aligned;
            }
            Some(old)
        }
    }

    /// Check every heap invariant; log and return `false` on a violation.
    ///
    /// Walks the blocks to confirm the tiling, the block count, the in-use
    /// byte counter and the free-block minimum size, then walks the free
    /// list to confirm it holds exactly the free blocks with mutual links.
    /// Trips [`breakpoint`] before reporting.
    pub fn validate(&self) -> bool {
        let mut blocks = 0_usize;
        let mut tiled = 0_usize;
        let mut used_bytes = 0_usize;
        let mut free_blocks = 0_usize;
        for block in self.region.blocks() {
            blocks += 1;
            let header = self.region.header(block);
            tiled += Header::SIZE + header.size();
            if header.is_used() {
                used_bytes += header.size();
            } else {
                free_blocks += 1;
                if header.size() < NODE_SIZE {
                    error!(
                        "heap corrupt: free block at {:#06x} of {} bytes cannot hold a list node",
                        block.as_usize(),
                        header.size()
                    );
                    breakpoint();
                    return false;
                }
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

        let mut listed = 0_usize;
        let mut previous = None;
        for node in self.list.iter(&self.region) {
            if listed > blocks {
                error!("free list corrupt: more nodes than blocks, assuming a cycle");
                breakpoint();
                return false;
            }
            if self.region.header(node).is_used() {
                error!(
                    "free list corrupt: in-use block at {:#06x} is listed",
                    node.as_usize()
                );
                breakpoint();
                return false;
            }
            if !self.list.back_link_is(&self.region, node, previous) {
                error!(
                    "free list corrupt: back-link of node at {:#06x} does not match",
                    node.as_usize()
                );
                breakpoint();
                return false;
            }
            previous = Some(node);
            listed += 1;
        }
        if listed != free_blocks {
            error!("free list corrupt: {listed} nodes listed, {free_blocks} free blocks walked");
            breakpoint();
            return false;
        }
        true
    }

    /// Log the block table and the free-list chain for debugging.
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
        for (index, node) in self.list.iter(&self.region).enumerate() {
            debug!("free list node {index}: block at {:#06x}", node.as_usize());
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
