//! Access to physical frames through the kernel's physical-memory window.
//!
//! The bootloader maps all of physical memory at a fixed virtual offset;
//! every frame access in this crate goes through that window.

use x86_64::structures::paging::{PageTable, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use super::PAGE_SIZE;

/// Physical-to-virtual translation by constant offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMap {
    offset: u64,
}

impl PhysMap {
    /// Create a translator for memory mapped at `physical_memory_offset`.
    ///
    /// # Safety
    /// Every physical address later passed to this translator must be
    /// mapped, readable and writable at `physical_memory_offset + addr`.
    pub unsafe fn new(physical_memory_offset: VirtAddr) -> Self {
        PhysMap {
            offset: physical_memory_offset.as_u64(),
        }
    }

    /// Create a translator from a raw (possibly wrapping) offset.
    ///
    /// # Safety
    /// Same contract as [`PhysMap::new`].
    pub const unsafe fn from_raw_offset(offset: u64) -> Self {
        PhysMap { offset }
    }

    /// Virtual address at which `addr` is visible.
    pub fn to_virt(&self, addr: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.offset.wrapping_add(addr.as_u64()))
    }

    /// Raw pointer to the first byte of `frame`.
    pub fn frame_ptr(&self, frame: PhysFrame<Size4KiB>) -> *mut u8 {
        self.to_virt(frame.start_address()).as_mut_ptr()
    }

    /// Overwrite the whole frame with `byte`.
    ///
    /// # Safety
    /// The frame must not be referenced through any live Rust reference.
    pub unsafe fn fill(&self, frame: PhysFrame<Size4KiB>, byte: u8) {
        unsafe { self.frame_ptr(frame).write_bytes(byte, PAGE_SIZE as usize) }
    }

    /// Copy all bytes of `src` into `dst`.
    ///
    /// # Safety
    /// The frames must differ and `dst` must not be referenced elsewhere.
    pub unsafe fn copy(&self, src: PhysFrame<Size4KiB>, dst: PhysFrame<Size4KiB>) {
        debug_assert_ne!(src, dst);
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(src) as *const u8,
                self.frame_ptr(dst),
                PAGE_SIZE as usize,
            )
        }
    }

    /// Borrow the frame's contents.
    ///
    /// # Safety
    /// No mutable access to the frame may exist for `'a`.
    pub unsafe fn bytes<'a>(&self, frame: PhysFrame<Size4KiB>) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.frame_ptr(frame), PAGE_SIZE as usize) }
    }

    /// Mutably borrow the frame's contents.
    ///
    /// # Safety
    /// No other access to the frame may exist for `'a`.
    pub unsafe fn bytes_mut<'a>(&self, frame: PhysFrame<Size4KiB>) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.frame_ptr(frame), PAGE_SIZE as usize) }
    }

    /// Interpret `frame` as a page table.
    ///
    /// # Safety
    /// The frame must hold a page table (or be about to be zeroed into one)
    /// and must not be aliased for `'a`.
    pub unsafe fn table<'a>(&self, frame: PhysFrame<Size4KiB>) -> &'a mut PageTable {
        let table_ptr: *mut PageTable = self.to_virt(frame.start_address()).as_mut_ptr();
        unsafe { &mut *table_ptr }
    }
}
