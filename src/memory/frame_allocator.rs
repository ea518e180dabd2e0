//! Reference-counted physical frame allocator.
//!
//! Every frame in the managed range is either free (on the free list,
//! count 0) or allocated (count = number of page-table entries mapping
//! it). The free list and the count table are guarded together by one
//! spinlock, held only for O(1) bookkeeping and the free-time scrub.

use alloc::vec;
use alloc::vec::Vec;
use log::{trace, warn};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use super::freelist::FreeList;
use super::{FrameNumber, PhysMap, ALLOC_JUNK, FREE_JUNK, PAGE_SIZE};

/// State guarded by the allocator lock.
struct Inner {
    free: FreeList,
    /// Live mappings per frame, indexed by frame offset from the range start.
    refs: Vec<u32>,
}

/// Physical frame allocator with per-frame reference counts.
pub struct PageFrameAllocator {
    /// First managed frame (inclusive).
    start: PhysAddr,
    /// End of the last managed frame (exclusive).
    end: PhysAddr,
    phys: PhysMap,
    inner: Mutex<Inner>,
}

impl PageFrameAllocator {
    /// Build an allocator owning every whole frame in `[range_start, range_end)`.
    ///
    /// `range_start` is rounded up to a frame boundary. Each frame is
    /// scrubbed and pushed onto the free list, lowest address first.
    ///
    /// # Safety
    /// The caller must guarantee that the range is unused RAM and that it
    /// is mapped through `phys`.
    pub unsafe fn init(range_start: PhysAddr, range_end: PhysAddr, phys: PhysMap) -> Self {
        let start = range_start.align_up(PAGE_SIZE);
        let frames = range_end.as_u64().saturating_sub(start.as_u64()) / PAGE_SIZE;
        let end = start + frames * PAGE_SIZE;

        let kmem = PageFrameAllocator {
            start,
            end,
            phys,
            inner: Mutex::new(Inner {
                free: FreeList::with_capacity(frames as usize),
                refs: vec![0; frames as usize],
            }),
        };

        {
            let mut inner = kmem.inner.lock();
            for n in 0..frames {
                let number = FrameNumber::containing(start + n * PAGE_SIZE);
                unsafe { phys.fill(number.into(), FREE_JUNK) };
                inner.free.push(number);
            }
        }

        trace!(
            "[KMEM] managing {:#x}..{:#x} ({} frames)",
            start.as_u64(),
            end.as_u64(),
            frames
        );
        kmem
    }

    /// Allocate one frame with a reference count of 1.
    ///
    /// Returns `None` when every frame is in use. The frame is filled with
    /// [`ALLOC_JUNK`] so reads of uninitialized memory stand out.
    pub fn alloc(&self) -> Option<PhysFrame<Size4KiB>> {
        let number = {
            let mut inner = self.inner.lock();
            let number = inner.free.pop();
            if let Some(number) = number {
                let slot = self.slot_of(number);
                inner.refs[slot] = 1;
            }
            number
        };

        let Some(number) = number else {
            warn!("[KMEM] out of physical frames");
            return None;
        };

        let frame = PhysFrame::from(number);
        // SAFETY: just popped, so nobody else holds this frame.
        unsafe { self.phys.fill(frame, ALLOC_JUNK) };
        trace!("[KMEM] alloc {}", number);
        Some(frame)
    }

    /// Drop one reference to the frame at `addr`.
    ///
    /// The frame returns to the free list only when its count reaches
    /// zero; until then this is just a decrement.
    ///
    /// # Panics
    /// On a misaligned or unmanaged address, or on a frame that is already
    /// free. Each of these means memory corruption elsewhere.
    pub fn free(&self, addr: PhysAddr) {
        let Some(number) = self.managed(addr) else {
            panic!("free: bad frame address {:#x}", addr.as_u64());
        };
        let slot = self.slot_of(number);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let count = &mut inner.refs[slot];
        assert!(*count > 0, "free: frame {:#x} is already free", addr.as_u64());
        *count -= 1;

        if *count == 0 {
            // SAFETY: last reference is gone; the frame belongs to us again.
            unsafe { self.phys.fill(number.into(), FREE_JUNK) };
            inner.free.push(number);
            trace!("[KMEM] free {}", number);
        }
    }

    /// Record one more mapping of an already-allocated frame.
    ///
    /// Callers must only pass frames they know to be mapped.
    pub fn incref(&self, frame: PhysFrame<Size4KiB>) {
        let slot = self.slot_or_panic(frame);
        let mut inner = self.inner.lock();
        debug_assert!(inner.refs[slot] > 0, "incref of free frame {:?}", frame);
        inner.refs[slot] += 1;
    }

    /// Run `f` inside the allocator's critical section if `frame` has
    /// exactly one reference. Returns `None` (without running `f`) otherwise.
    ///
    /// A concurrent `incref` cannot slip between the check and `f`.
    pub(crate) fn claim_sole_owner<R>(
        &self,
        frame: PhysFrame<Size4KiB>,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let slot = self.slot_or_panic(frame);
        let inner = self.inner.lock();
        if inner.refs[slot] == 1 {
            Some(f())
        } else {
            None
        }
    }

    /// Current reference count of `frame`.
    pub fn ref_count(&self, frame: PhysFrame<Size4KiB>) -> u32 {
        let slot = self.slot_or_panic(frame);
        self.inner.lock().refs[slot]
    }

    /// Whether `frame` lies in the managed range.
    pub fn manages(&self, frame: PhysFrame<Size4KiB>) -> bool {
        self.managed(frame.start_address()).is_some()
    }

    /// Whether `frame` is on the free list.
    pub fn is_free(&self, frame: PhysFrame<Size4KiB>) -> bool {
        self.inner.lock().free.contains(frame.into())
    }

    /// Number of frames on the free list.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of frames in the managed range.
    pub fn total_frames(&self) -> usize {
        ((self.end.as_u64() - self.start.as_u64()) / PAGE_SIZE) as usize
    }

    /// Managed range, frame-aligned, `start..end`.
    pub fn range(&self) -> (PhysAddr, PhysAddr) {
        (self.start, self.end)
    }

    /// Physical-memory window used for frame contents.
    pub fn phys(&self) -> PhysMap {
        self.phys
    }

    /// Frame number for `addr` if it is frame-aligned and managed.
    fn managed(&self, addr: PhysAddr) -> Option<FrameNumber> {
        if addr < self.start || addr >= self.end {
            return None;
        }
        FrameNumber::from_start_address(addr)
    }

    fn slot_of(&self, number: FrameNumber) -> usize {
        (number.raw() - FrameNumber::containing(self.start).raw()) as usize
    }

    fn slot_or_panic(&self, frame: PhysFrame<Size4KiB>) -> usize {
        match self.managed(frame.start_address()) {
            Some(number) => self.slot_of(number),
            None => panic!("frame {:?} is outside the managed range", frame),
        }
    }
}

// Lets x86_64 paging helpers (`Mapper::map_to` and friends) draw frames
// from the kernel allocator.
unsafe impl FrameAllocator<Size4KiB> for &PageFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.alloc()
    }
}

impl FrameDeallocator<Size4KiB> for &PageFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free(frame.start_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_ram::{TestRam, RAM_BASE};
    use alloc::collections::BTreeSet;

    fn setup(frames: usize) -> (TestRam, PageFrameAllocator) {
        let ram = TestRam::new(frames);
        let kmem = unsafe { PageFrameAllocator::init(ram.start(), ram.end(), ram.phys()) };
        (ram, kmem)
    }

    fn bytes(kmem: &PageFrameAllocator, frame: PhysFrame<Size4KiB>) -> &[u8] {
        unsafe { kmem.phys().bytes(frame) }
    }

    #[test]
    fn init_frees_every_whole_frame() {
        let (_ram, kmem) = setup(8);
        assert_eq!(kmem.total_frames(), 8);
        assert_eq!(kmem.free_frames(), 8);
        assert_eq!(kmem.range(), (PhysAddr::new(RAM_BASE), PhysAddr::new(RAM_BASE + 8 * PAGE_SIZE)));
    }

    #[test]
    fn init_rounds_start_up_and_drops_partial_tail() {
        let ram = TestRam::new(8);
        let start = PhysAddr::new(RAM_BASE + 10);
        let end = PhysAddr::new(RAM_BASE + 8 * PAGE_SIZE - 1);
        let kmem = unsafe { PageFrameAllocator::init(start, end, ram.phys()) };
        assert_eq!(kmem.total_frames(), 6);
        assert_eq!(kmem.range().0, PhysAddr::new(RAM_BASE + PAGE_SIZE));
    }

    #[test]
    fn empty_range_is_always_exhausted() {
        let ram = TestRam::new(1);
        let kmem = unsafe { PageFrameAllocator::init(ram.end(), ram.start(), ram.phys()) };
        assert_eq!(kmem.total_frames(), 0);
        assert!(kmem.alloc().is_none());
    }

    #[test]
    fn first_alloc_is_highest_frame_with_one_ref() {
        let (ram, kmem) = setup(4);
        let frame = kmem.alloc().unwrap();
        assert_eq!(frame.start_address(), ram.end() - PAGE_SIZE);
        assert_eq!(kmem.ref_count(frame), 1);
        assert!(!kmem.is_free(frame));
    }

    #[test]
    fn allocations_are_distinct_until_exhaustion() {
        let (_ram, kmem) = setup(16);
        let mut seen = BTreeSet::new();
        while let Some(frame) = kmem.alloc() {
            assert!(seen.insert(frame), "{:?} handed out twice", frame);
        }
        assert_eq!(seen.len(), 16);
        assert_eq!(kmem.free_frames(), 0);
        assert!(kmem.alloc().is_none());
    }

    #[test]
    fn sentinels_mark_free_and_fresh_frames() {
        let (_ram, kmem) = setup(2);
        let frame = kmem.alloc().unwrap();
        assert!(bytes(&kmem, frame).iter().all(|&b| b == ALLOC_JUNK));

        unsafe { kmem.phys().bytes_mut(frame)[..4].copy_from_slice(b"data") };
        kmem.free(frame.start_address());
        assert!(bytes(&kmem, frame).iter().all(|&b| b == FREE_JUNK));
    }

    #[test]
    fn free_last_reference_returns_frame() {
        let (_ram, kmem) = setup(2);
        let frame = kmem.alloc().unwrap();
        kmem.free(frame.start_address());
        assert_eq!(kmem.ref_count(frame), 0);
        assert!(kmem.is_free(frame));
        assert_eq!(kmem.alloc(), Some(frame));
    }

    #[test]
    fn free_shared_frame_only_decrements() {
        let (_ram, kmem) = setup(2);
        let shared = kmem.alloc().unwrap();
        kmem.incref(shared);
        assert_eq!(kmem.ref_count(shared), 2);

        kmem.free(shared.start_address());
        assert_eq!(kmem.ref_count(shared), 1);
        assert!(!kmem.is_free(shared));

        let other = kmem.alloc().unwrap();
        assert_ne!(other, shared);
        assert!(kmem.alloc().is_none());

        kmem.free(shared.start_address());
        assert!(kmem.is_free(shared));
    }

    #[test]
    fn claim_sole_owner_checks_count_under_lock() {
        let (_ram, kmem) = setup(2);
        let frame = kmem.alloc().unwrap();
        assert_eq!(kmem.claim_sole_owner(frame, || 7), Some(7));

        kmem.incref(frame);
        let mut ran = false;
        assert_eq!(kmem.claim_sole_owner(frame, || ran = true), None);
        assert!(!ran);
    }

    #[test]
    fn manages_only_its_own_range() {
        let (ram, kmem) = setup(2);
        let frame = kmem.alloc().unwrap();
        assert!(kmem.manages(frame));
        assert!(!kmem.manages(PhysFrame::containing_address(ram.end())));
        assert!(!kmem.manages(PhysFrame::containing_address(ram.start() - PAGE_SIZE)));
    }

    #[test]
    fn usable_through_x86_64_frame_traits() {
        let (_ram, kmem) = setup(2);
        let mut frames = &kmem;
        let frame = frames.allocate_frame().unwrap();
        assert_eq!(kmem.ref_count(frame), 1);
        unsafe { frames.deallocate_frame(frame) };
        assert!(kmem.is_free(frame));
    }

    #[test]
    #[should_panic(expected = "bad frame address")]
    fn free_misaligned_is_fatal() {
        let (_ram, kmem) = setup(2);
        let frame = kmem.alloc().unwrap();
        kmem.free(frame.start_address() + 8u64);
    }

    #[test]
    #[should_panic(expected = "bad frame address")]
    fn free_below_range_is_fatal() {
        let (ram, kmem) = setup(2);
        kmem.free(ram.start() - PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "bad frame address")]
    fn free_at_range_end_is_fatal() {
        let (ram, kmem) = setup(2);
        kmem.free(ram.end());
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_is_fatal() {
        let (_ram, kmem) = setup(2);
        let frame = kmem.alloc().unwrap();
        kmem.free(frame.start_address());
        kmem.free(frame.start_address());
    }
}
