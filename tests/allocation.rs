//! End-to-end workloads against the public allocator API.
//!
//! These tests only use what a client of the crate can use: the payload
//! pointers, the byte contents behind them and the validation entry point.
//! The finer-grained block-table assertions live in the unit tests next to
//! the allocator sources.
use fitalloc::{ExplicitHeap, ImplicitHeap};

use core::mem::MaybeUninit;
use core::ptr::NonNull;

#[repr(align(8))]
struct Arena<const N: usize>([MaybeUninit<u8>; N]);

impl<const N: usize> Arena<N> {
    fn boxed() -> Box<Self> {
        Box::new(Self([MaybeUninit::uninit(); N]))
    }

    fn base(&mut self) -> NonNull<u8> {
        NonNull::new(self.0.as_mut_ptr().cast::<u8>()).unwrap()
    }
}

fn fill(ptr: NonNull<u8>, len: usize, value: u8) {
    // SAFETY: callers pass a live allocation of at least `len` bytes.
    unsafe {
        core::ptr::write_bytes(ptr.as_ptr(), value, len);
    }
}

#[track_caller]
fn assert_filled(ptr: NonNull<u8>, len: usize, value: u8) {
    // SAFETY: callers pass a live allocation of at least `len` bytes.
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) };
    assert!(bytes.iter().all(|&b| b == value), "payload bytes were lost");
}

#[test]
fn explicit_grow_preserves_contents_across_a_move() {
    let mut arena = Arena::<1024>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ExplicitHeap::init(arena.base(), 1024) }.unwrap();

    let a = heap.allocate(100).unwrap();
    let blocker = heap.allocate(16).unwrap();
    fill(a, 100, 0xa5);
    fill(blocker, 16, 0x11);

    // the in-use neighbor forces the grow to relocate
    // SAFETY: `a` is a live allocation of this heap.
    let b = unsafe { heap.reallocate(a.as_ptr(), 400) }.unwrap();
    assert_ne!(a, b);
    assert_filled(b, 100, 0xa5);
    assert_filled(blocker, 16, 0x11);
    assert!(heap.validate());
}

#[test]
fn explicit_grow_in_place_preserves_contents() {
    let mut arena = Arena::<1024>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ExplicitHeap::init(arena.base(), 1024) }.unwrap();

    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    fill(a, 64, 0x3c);
    // SAFETY: `b` is a live allocation of this heap.
    unsafe { heap.free(b.as_ptr()) };

    // with the right neighbor free again, `a` grows where it is
    // SAFETY: `a` is a live allocation of this heap.
    let grown = unsafe { heap.reallocate(a.as_ptr(), 96) }.unwrap();
    assert_eq!(grown, a);
    assert_filled(grown, 64, 0x3c);
    assert!(heap.validate());
}

#[test]
fn implicit_grow_preserves_contents() {
    let mut arena = Arena::<1024>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ImplicitHeap::init(arena.base(), 1024) }.unwrap();

    let a = heap.allocate(48).unwrap();
    heap.allocate(16).unwrap();
    fill(a, 48, 0x77);

    // SAFETY: `a` is a live allocation of this heap.
    let b = unsafe { heap.reallocate(a.as_ptr(), 160) }.unwrap();
    assert_filled(b, 48, 0x77);
    assert!(heap.validate());
}

#[test]
fn realloc_of_null_allocates_and_zero_size_frees() {
    let mut arena = Arena::<256>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ExplicitHeap::init(arena.base(), 256) }.unwrap();

    // SAFETY: null is explicitly allowed.
    let p = unsafe { heap.reallocate(core::ptr::null_mut(), 32) }.unwrap();
    assert_eq!(heap.bytes_in_use(), 32);

    // SAFETY: `p` is a live allocation of this heap.
    let gone = unsafe { heap.reallocate(p.as_ptr(), 0) };
    assert!(gone.is_none());
    assert_eq!(heap.bytes_in_use(), 0);
    assert!(heap.validate());
}

#[test]
fn failed_grow_leaves_the_old_allocation_usable() {
    let mut arena = Arena::<256>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ExplicitHeap::init(arena.base(), 256) }.unwrap();

    let a = heap.allocate(64).unwrap();
    heap.allocate(152).unwrap();
    fill(a, 64, 0xee);

    // SAFETY: `a` is a live allocation of this heap.
    let result = unsafe { heap.reallocate(a.as_ptr(), 1024) };
    assert!(result.is_none());
    assert_filled(a, 64, 0xee);
    assert!(heap.validate());

    // the old allocation can still be freed normally
    // SAFETY: `a` is still a live allocation of this heap.
    unsafe { heap.free(a.as_ptr()) };
    assert!(heap.validate());
}

#[test]
fn allocation_until_exhaustion_and_recovery() {
    let mut arena = Arena::<256>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ExplicitHeap::init(arena.base(), 256) }.unwrap();

    let mut held = Vec::new();
    while let Some(p) = heap.allocate(24) {
        held.push(p);
    }
    assert!(!held.is_empty());
    assert!(heap.allocate(1).is_none());
    assert!(heap.validate());

    // freeing in address-descending order coalesces back to one big block
    for p in held.iter().rev() {
        // SAFETY: every pointer in `held` is a live allocation.
        unsafe { heap.free(p.as_ptr()) };
    }
    assert!(heap.validate());
    assert_eq!(heap.block_count(), 1);
    assert!(heap.allocate(200).is_some());
}

#[test]
fn implicit_exhaustion_keeps_invariants() {
    let mut arena = Arena::<256>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ImplicitHeap::init(arena.base(), 256) }.unwrap();

    while heap.allocate(8).is_some() {}
    assert!(heap.allocate(1).is_none());
    assert!(heap.validate());
}

#[test]
fn payloads_are_aligned_and_disjoint() {
    let mut arena = Arena::<1024>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ExplicitHeap::init(arena.base(), 1024) }.unwrap();

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for request in [1, 7, 8, 13, 100, 31] {
        let p = heap.allocate(request).unwrap();
        let start = p.as_ptr() as usize;
        assert_eq!(start % 8, 0, "payload is misaligned");
        for &(other, len) in &ranges {
            assert!(
                start + request <= other || other + len <= start,
                "allocations overlap"
            );
        }
        ranges.push((start, request));
    }
    assert!(heap.validate());
}

#[test]
fn reset_invalidates_and_starts_over() {
    let mut arena = Arena::<256>::boxed();
    // SAFETY: the boxed arena outlives the heap and is used by nothing else.
    let mut heap = unsafe { ExplicitHeap::init(arena.base(), 256) }.unwrap();

    heap.allocate(100).unwrap();
    heap.reset();
    assert_eq!(heap.bytes_in_use(), 0);
    assert_eq!(heap.block_count(), 1);
    assert!(heap.allocate(200).is_some());
    assert!(heap.validate());
}
