//! Copy-on-write fault resolution.
//!
//! After [`AddressSpace::duplicate`] a writable page is mapped read-only
//! with the [`COW`] bit in every sharer. The first write from any sharer
//! faults here:
//!
//! - sole remaining owner (count 1): flip the entry back to writable in place
//! - still shared (count > 1): copy into a fresh frame, point the entry at
//!   it, and drop this space's reference on the old frame
//!
//! Concurrent faults on the same shared frame from different spaces may
//! each take the copy path. Every path goes through the allocator lock, so
//! the only cost is a redundant copy.

use log::{debug, warn};
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use super::{AddressSpace, MemError, PageFrameAllocator, COW, MAX_VA, PAGE_SIZE};

/// Resolve a write fault at `va` in `space`.
///
/// On success the entry is writable, not COW, and backed by a frame this
/// space owns alone; the faulting access can be retried. Faults this
/// handler does not own (`AddressTooHigh`, `NotMapped`, `NotUser`,
/// `NotCow`) change nothing. `OutOfMemory` means the copy could not be made.
pub fn resolve_write_fault(
    kmem: &PageFrameAllocator,
    space: &mut AddressSpace,
    va: VirtAddr,
) -> Result<(), MemError> {
    let addr = va.as_u64();
    if addr >= MAX_VA {
        return Err(MemError::AddressTooHigh(addr));
    }

    let entry = space
        .walk(kmem, va.align_down(PAGE_SIZE), false)
        .ok_or(MemError::NotMapped(addr))?;
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) {
        return Err(MemError::NotMapped(addr));
    }
    if !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        return Err(MemError::NotUser(addr));
    }
    if !flags.contains(COW) {
        return Err(MemError::NotCow(addr));
    }
    let old = entry.frame().map_err(|_| MemError::NotMapped(addr))?;
    let writable = (flags - COW) | PageTableFlags::WRITABLE;

    // Check and flip in one critical section so a sibling's `incref`
    // cannot land in between.
    if kmem
        .claim_sole_owner(old, || entry.set_flags(writable))
        .is_some()
    {
        debug!("[COW] {:#x}: sole owner of {:?}, writable in place", addr, old);
        return Ok(());
    }

    let Some(new) = kmem.alloc() else {
        warn!("[COW] {:#x}: no frame to copy {:?} into", addr, old);
        return Err(MemError::OutOfMemory);
    };
    // SAFETY: `new` is unshared until the entry below points at it; `old`
    // stays alive because this space still holds a reference to it.
    unsafe { kmem.phys().copy(old, new) };
    entry.set_frame(new, writable);
    kmem.free(old.start_address());

    debug!("[COW] {:#x}: copied {:?} -> {:?}", addr, old, new);
    Ok(())
}
