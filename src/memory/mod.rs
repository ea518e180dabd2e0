//! Physical memory management.
//!
//! Provides:
//! - Reference-counted physical frame allocation ([`PageFrameAllocator`])
//! - x86_64 address spaces with copy-on-write duplication ([`AddressSpace`])
//! - Write-fault resolution for shared pages ([`resolve_write_fault`])

pub mod boot;
pub mod cow;
pub mod frame;
pub mod frame_allocator;
pub mod freelist;
pub mod paging;
pub mod phys;

#[cfg(test)]
pub(crate) mod test_ram;

use log::info;
use spin::Once;
use thiserror::Error;
use x86_64::structures::paging::PageTableFlags;
use x86_64::PhysAddr;

pub use cow::resolve_write_fault;
pub use frame::FrameNumber;
pub use frame_allocator::PageFrameAllocator;
pub use paging::AddressSpace;
pub use phys::PhysMap;

// ─── Constants ───────────────────────────────────────────────────

/// Size of one physical frame / virtual page.
pub const PAGE_SIZE: u64 = 4096;

/// First virtual address above the user half (canonical lower half on x86_64).
pub const MAX_VA: u64 = 1 << 47;

/// Byte written over a frame when it returns to the free list.
pub const FREE_JUNK: u8 = 0x01;

/// Byte written over a frame when it is handed out by `alloc`.
pub const ALLOC_JUNK: u8 = 0x05;

/// Software-defined entry bit marking a shared, write-protected page.
pub const COW: PageTableFlags = PageTableFlags::BIT_9;

// ─── Errors ─────────────────────────────────────────────────────

/// Memory operation errors.
///
/// None of these are fatal: corruption (bad `free`, double free) panics
/// instead of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    /// No free frame left.
    #[error("out of physical frames")]
    OutOfMemory,
    /// Virtual address at or above [`MAX_VA`].
    #[error("address {0:#x} is above the user ceiling")]
    AddressTooHigh(u64),
    /// No valid leaf entry for the address.
    #[error("address {0:#x} is not mapped")]
    NotMapped(u64),
    /// Leaf entry exists but is kernel-only.
    #[error("address {0:#x} is not user-accessible")]
    NotUser(u64),
    /// Leaf entry is not copy-on-write, so a write fault on it is a real fault.
    #[error("address {0:#x} is not a copy-on-write page")]
    NotCow(u64),
    /// A leaf entry already exists.
    #[error("address {0:#x} is already mapped")]
    AlreadyMapped(u64),
    /// Address not on a page boundary.
    #[error("address {0:#x} is not page-aligned")]
    Misaligned(u64),
    /// Physical frame outside the allocator's range; it cannot be
    /// reference-counted, so it cannot be mapped into a user space.
    #[error("frame {0:#x} is not managed by the frame allocator")]
    Unmanaged(u64),
}

impl MemError {
    /// True for faults the COW resolver refuses to handle.
    ///
    /// The trap path turns these into an ordinary process fault.
    pub fn is_fault_not_ours(&self) -> bool {
        matches!(
            self,
            MemError::AddressTooHigh(_)
                | MemError::NotMapped(_)
                | MemError::NotUser(_)
                | MemError::NotCow(_)
        )
    }
}

// ─── Global allocator instance ──────────────────────────────────

static KMEM: Once<PageFrameAllocator> = Once::new();

/// Initialize the kernel-wide frame allocator over `[start, end)`.
///
/// Must be called exactly once, before any other memory operation.
///
/// # Safety
/// Every frame in the range must be unused and mapped through `phys`.
pub unsafe fn init(start: PhysAddr, end: PhysAddr, phys: PhysMap) -> &'static PageFrameAllocator {
    let kmem = unsafe { install(&KMEM, start, end, phys) };
    info!(
        "[OK] Frame allocator initialized ({} frames, {} KiB)",
        kmem.total_frames(),
        kmem.total_frames() as u64 * PAGE_SIZE / 1024
    );
    kmem
}

/// Build the allocator into `cell`, panicking unless this call is the one
/// that ran the initializer.
unsafe fn install(
    cell: &Once<PageFrameAllocator>,
    start: PhysAddr,
    end: PhysAddr,
    phys: PhysMap,
) -> &PageFrameAllocator {
    let mut ran = false;
    let kmem = cell.call_once(|| {
        ran = true;
        unsafe { PageFrameAllocator::init(start, end, phys) }
    });
    assert!(ran, "memory::init called twice");
    kmem
}

/// The kernel-wide frame allocator, once [`init`] has run.
pub fn allocator() -> Option<&'static PageFrameAllocator> {
    KMEM.get()
}
