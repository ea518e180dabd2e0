//! Picking the allocator's range from the bootloader memory map.

use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use x86_64::PhysAddr;

use super::PAGE_SIZE;

/// Number of whole usable frames in the memory map.
pub fn usable_frames(regions: &[MemoryRegion]) -> u64 {
    regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| whole_frames(r.start, r.end))
        .sum()
}

/// The largest usable region, as a `start..end` range for
/// [`PageFrameAllocator::init`](super::PageFrameAllocator::init).
///
/// Ties go to the lowest region. Regions with no whole frame are skipped.
pub fn usable_range(regions: &[MemoryRegion]) -> Option<(PhysAddr, PhysAddr)> {
    let mut best: Option<&MemoryRegion> = None;
    for region in regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
        let frames = whole_frames(region.start, region.end);
        if frames == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => {
                let best_frames = whole_frames(b.start, b.end);
                frames > best_frames || (frames == best_frames && region.start < b.start)
            }
        };
        if better {
            best = Some(region);
        }
    }
    best.map(|r| (PhysAddr::new(r.start), PhysAddr::new(r.end)))
}

fn whole_frames(start: u64, end: u64) -> u64 {
    let first = start.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    end.saturating_sub(first) / PAGE_SIZE
}
