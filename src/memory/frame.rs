//! Frame index value type.

use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use super::PAGE_SIZE;

const FRAME_SHIFT: u32 = 12;

/// Physical frame number: the physical address shifted right by 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    /// Frame number of the frame starting at `addr`, or `None` if `addr`
    /// is not frame-aligned.
    pub fn from_start_address(addr: PhysAddr) -> Option<Self> {
        if addr.is_aligned(PAGE_SIZE) {
            Some(FrameNumber(addr.as_u64() >> FRAME_SHIFT))
        } else {
            None
        }
    }

    /// Frame number of the frame containing `addr`.
    pub fn containing(addr: PhysAddr) -> Self {
        FrameNumber(addr.as_u64() >> FRAME_SHIFT)
    }

    /// First physical address of the frame.
    pub fn start_address(self) -> PhysAddr {
        PhysAddr::new(self.0 << FRAME_SHIFT)
    }

    /// Get the raw frame number.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<PhysFrame<Size4KiB>> for FrameNumber {
    fn from(frame: PhysFrame<Size4KiB>) -> Self {
        FrameNumber(frame.start_address().as_u64() >> FRAME_SHIFT)
    }
}

impl From<FrameNumber> for PhysFrame<Size4KiB> {
    fn from(number: FrameNumber) -> Self {
        PhysFrame::containing_address(number.start_address())
    }
}

impl core::fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "PFN#{:#x}", self.0)
    }
}
