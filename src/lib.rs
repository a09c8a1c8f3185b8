//! First-fit heap allocators over a fixed memory region
//!
//! This crate manages a single contiguous byte region handed to it once, at
//! initialization. It never asks the operating system for more memory: the
//! region is carved into *blocks*, each a one-word header followed by its
//! payload, and the classic three-operation interface (allocate, free,
//! reallocate) is serviced entirely inside that region.
//!
//! ```text
//! hhhhhhhh pppppppppppppppp hhhhhhhh pppppppp
//! ^------- ^--------------- ^------- ^-------
//! header   payload, 16      header   payload, 8
//! (size|used bit)           (size|used bit)
//! ```
//!
//! The header word packs the payload size and an in-use flag: sizes are
//! always multiples of [`ALIGNMENT`], so the lowest bit of the word is free
//! to carry the flag. Starting from the region base, the blocks tile the
//! region exactly; stepping from one header to the next is a matter of
//! adding the header size and the encoded payload size.
//!
//! Two allocator flavors share this layout:
//!
//! - [`ImplicitHeap`] keeps no bookkeeping besides the headers. Allocation
//!   walks every block from the base and takes the first free fit. Freeing
//!   flips the flag and nothing else.
//! - [`ExplicitHeap`] threads a doubly-linked list through the payloads of
//!   the free blocks (most recently freed first) so allocation only visits
//!   free blocks. Freeing merges the block with a free right neighbor;
//!   reallocation absorbs whole chains of free right neighbors to grow in
//!   place where it can.
//!
//! Neither flavor ever merges to the left: blocks carry no footer, so the
//! left neighbor is only reachable by re-walking the region.
//!
//! # Usage
//! Hand either heap a region and use the returned payload pointers:
//! ```
//! use core::mem::MaybeUninit;
//! use core::ptr::NonNull;
//!
//! #[repr(align(8))]
//! struct Storage([MaybeUninit<u8>; 1024]);
//! let mut storage = Storage([MaybeUninit::uninit(); 1024]);
//!
//! let base = NonNull::new(storage.0.as_mut_ptr().cast::<u8>()).unwrap();
//! // SAFETY: the storage is exclusively owned and outlives the heap.
//! let mut heap = unsafe { fitalloc::ExplicitHeap::init(base, 1024) }.unwrap();
//!
//! let p = heap.allocate(100).unwrap();
//! // SAFETY: `p` was returned by this heap and is not used afterwards.
//! let p = unsafe { heap.reallocate(p.as_ptr(), 200) }.unwrap();
//! // SAFETY: `p` was returned by this heap.
//! unsafe { heap.free(p.as_ptr()) };
//! assert!(heap.validate());
//! ```
//!
//! For use as a global allocator there is [`Heap`], which owns its region
//! inline and protects it with a spin lock:
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: fitalloc::Heap<4096> = fitalloc::Heap::new();
//!
//! extern crate alloc;
//! ```
//!
//! # Contract
//! The raw heaps are single-threaded; [`Heap`] adds the locking. Passing a
//! foreign pointer, double-freeing or using a block after freeing it is
//! undefined behavior, exactly as with `malloc`: the allocator derives the
//! header address from the payload address and trusts what it finds there.
//! [`validate`](ExplicitHeap::validate) exists to diagnose the aftermath:
//! it re-checks every structural invariant, logs the first violation and
//! trips [`breakpoint`] for the debugger.
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod explicit;
mod freelist;
mod header;
mod implicit;
mod region;

pub use explicit::ExplicitHeap;
pub use implicit::ImplicitHeap;

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

/// The alignment of every payload address and payload size, in bytes.
pub const ALIGNMENT: usize = 8;

/// The largest byte count a single allocation request may ask for.
pub const MAX_REQUEST_SIZE: usize = 1 << 30;

/// An error occurred when calling `init()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The region cannot hold even the initial bookkeeping (one header for
    /// the implicit heap, a header plus one list node for the explicit one).
    RegionTooSmall,
    /// The region base or capacity is not a multiple of [`ALIGNMENT`].
    Misaligned,
}

/// The hook tripped by `validate()` on every invariant violation.
///
/// The function does nothing. Its value is the symbol: set a debugger
/// breakpoint on `fitalloc::breakpoint` and a failing validation stops the
/// program right where the corruption was noticed.
#[inline(never)]
pub fn breakpoint() {
    // keep the call site from being optimized away
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

/// The inline backing memory of a [`Heap`].
#[repr(align(8))] // = ALIGNMENT
struct Arena<const N: usize>([MaybeUninit<u8>; N]);

/// The lock-protected interior of a [`Heap`].
///
/// The arena and the allocator state live side by side: the state holds
/// pointers into the arena, which is why it is created lazily once the
/// containing value has its final (static) address.
struct HeapInner<const N: usize> {
    memory: Arena<N>,
    state: Option<ExplicitHeap>,
}

// SAFETY: the pointers inside `state` target `memory` of the same value and
// nothing outside the owning mutex can observe them, so moving the value to
// another thread moves the pointees along with the pointers.
unsafe impl<const N: usize> Send for HeapInner<N> {}

impl<const N: usize> HeapInner<N> {
    fn heap(&mut self) -> Option<&mut ExplicitHeap> {
        if self.state.is_none() {
            let base = NonNull::new(self.memory.0.as_mut_ptr().cast::<u8>())?;
            // SAFETY: the arena is owned by this value, aligned through its
            // `repr(align)`, and only ever reached through the mutex
            // wrapping this value, so the heap has exclusive access.
            self.state = unsafe { ExplicitHeap::init(base, N) }.ok();
        }
        self.state.as_mut()
    }
}

/// A self-contained [`ExplicitHeap`] usable as the global allocator.
///
/// The heap memory is an inline buffer of `N` bytes, so the whole heap is
/// statically accounted and cannot grow into the stack. Assign it to a
/// `static` and register it:
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: fitalloc::Heap<4096> = fitalloc::Heap::new();
/// ```
///
/// The region serves payloads aligned to [`ALIGNMENT`]; layouts requesting
/// more than that are refused (allocation returns null). The region is
/// formatted on the first allocation, once the static has its final
/// address.
pub struct Heap<const N: usize> {
    inner: spin::Mutex<HeapInner<N>>,
}

impl<const N: usize> Heap<N> {
    /// Create a new [`Heap`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when declaring the allocator static.
    ///
    /// # Panics
    /// This function will panic if the buffer size `N` is less than `24`
    /// (one header plus one free-list node) or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(
            N >= 24,
            "too small heap memory: minimum size is 24 (header + list node)"
        );
        assert!(N % 8 == 0, "memory size has to be divisible by 8");

        let inner = spin::Mutex::new(HeapInner {
            memory: Arena([MaybeUninit::uninit(); N]),
            state: None,
        });
        Self { inner }
    }

    /// Run the heap's invariant checks; `true` when everything holds.
    ///
    /// A heap that never allocated is trivially valid.
    pub fn validate(&self) -> bool {
        self.inner
            .lock()
            .state
            .as_ref()
            .map_or(true, ExplicitHeap::validate)
    }

    /// Log the block table and free list for debugging.
    pub fn dump(&self) {
        if let Some(state) = self.inner.lock().state.as_ref() {
            state.dump();
        }
    }
}

// SAFETY: the allocator does not panic, hands out distinct in-region blocks
// of at least the requested size and refuses (with null) any layout it
// cannot align, satisfying the `GlobalAlloc` contract.
unsafe impl<const N: usize> GlobalAlloc for Heap<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // the region serves `ALIGNMENT`-aligned payloads and a header
        // cannot be recovered from an interior pointer, so larger
        // alignments are refused rather than over-allocated
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        match self
            .inner
            .lock()
            .heap()
            .and_then(|heap| heap.allocate(layout.size()))
        {
            Some(payload) => payload.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(heap) = self.inner.lock().heap() {
            // SAFETY: `ptr` was returned by `alloc`/`realloc` on this heap,
            // per the `GlobalAlloc` contract.
            unsafe { heap.free(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        match self.inner.lock().heap() {
            // SAFETY: `ptr` was returned by `alloc`/`realloc` on this heap,
            // per the `GlobalAlloc` contract.
            Some(heap) => match unsafe { heap.reallocate(ptr, new_size) } {
                Some(payload) => payload.as_ptr(),
                None => ptr::null_mut(),
            },
            None => ptr::null_mut(),
        }
    }
}
