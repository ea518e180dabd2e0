//! Heap-backed stand-in for physical RAM in unit tests.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use x86_64::PhysAddr;

use super::{PhysMap, PAGE_SIZE};

/// Physical base the simulated RAM pretends to live at.
pub const RAM_BASE: u64 = 0x8000_0000;

pub struct TestRam {
    ptr: *mut u8,
    layout: Layout,
}

impl TestRam {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        TestRam { ptr, layout }
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
}

impl Drop for TestRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

unsafe impl Send for TestRam {}
unsafe impl Sync for TestRam {}
