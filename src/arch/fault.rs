//! Page-fault dispatch.
//!
//! Decodes the hardware error code and routes write faults on present user
//! pages to the copy-on-write resolver. Everything else is refused so the
//! caller can kill the faulting process.

use log::debug;
use x86_64::VirtAddr;

use crate::memory::{resolve_write_fault, AddressSpace, MemError, PageFrameAllocator};

// ─── Error code ─────────────────────────────────────────────────

bitflags::bitflags! {
    /// Page-fault error code pushed by the CPU (Intel SDM Vol. 3, 4.7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCause: u64 {
        /// The page was present (protection violation), not missing.
        const PRESENT           = 1 << 0;
        /// The access was a write.
        const WRITE             = 1 << 1;
        /// The access came from ring 3.
        const USER              = 1 << 2;
        /// A reserved bit was set in a paging-structure entry.
        const RESERVED          = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

impl FaultCause {
    /// Decode the raw error code, ignoring bits this kernel does not use
    /// (protection keys, shadow stack, SGX).
    pub fn from_error_code(code: u64) -> Self {
        Self::from_bits_truncate(code)
    }

    /// A ring-3 write to a present page: the only shape a COW fault has.
    pub fn is_user_write_protect(&self) -> bool {
        self.contains(Self::PRESENT | Self::WRITE | Self::USER)
            && !self.intersects(Self::RESERVED | Self::INSTRUCTION_FETCH)
    }
}

// ─── Dispatch ───────────────────────────────────────────────────

/// Handle a page fault at `va` (CR2) in `space`.
///
/// `Ok` means the mapping was repaired and the instruction can be retried.
/// Errors for which [`MemError::is_fault_not_ours`] holds, and
/// `OutOfMemory`, end the faulting process.
pub fn handle_page_fault(
    kmem: &PageFrameAllocator,
    space: &mut AddressSpace,
    va: VirtAddr,
    cause: FaultCause,
) -> Result<(), MemError> {
    let addr = va.as_u64();
    if !cause.contains(FaultCause::PRESENT) {
        debug!("[FAULT] {:#x}: not present ({:?})", addr, cause);
        return Err(MemError::NotMapped(addr));
    }
    if !cause.contains(FaultCause::USER) {
        debug!("[FAULT] {:#x}: supervisor fault ({:?})", addr, cause);
        return Err(MemError::NotUser(addr));
    }
    if !cause.is_user_write_protect() {
        debug!("[FAULT] {:#x}: protection violation ({:?})", addr, cause);
        return Err(MemError::NotCow(addr));
    }
    resolve_write_fault(kmem, space, va)
}
