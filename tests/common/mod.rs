//! Simulated physical RAM shared by the integration tests.

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};

use kmem::memory::{PageFrameAllocator, PhysMap, PAGE_SIZE};
use x86_64::PhysAddr;

/// Where the simulated RAM pretends to start.
pub const RAM_BASE: u64 = 0x1_0000_0000;

/// A page-aligned heap buffer standing in for a range of physical frames.
pub struct Ram {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for Ram {}
unsafe impl Sync for Ram {}

impl Ram {
    pub fn new(frames: usize) -> Self {
        let layout =
            Layout::from_size_align(frames * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Ram { ptr, layout }
    }

    pub fn start(&self) -> PhysAddr {
        PhysAddr::new(RAM_BASE)
    }

    pub fn end(&self) -> PhysAddr {
        PhysAddr::new(RAM_BASE + self.layout.size() as u64)
    }

    pub fn phys(&self) -> PhysMap {
        unsafe { PhysMap::from_raw_offset((self.ptr as u64).wrapping_sub(RAM_BASE)) }
    }

    /// A fresh allocator owning all of this RAM.
    pub fn allocator(&self) -> PageFrameAllocator {
        unsafe { PageFrameAllocator::init(self.start(), self.end(), self.phys()) }
    }
}

impl Drop for Ram {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
