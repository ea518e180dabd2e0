//! User address spaces over x86_64 4-level page tables.
//!
//! Table frames and mapped frames all come from the
//! [`PageFrameAllocator`]. A leaf entry holds one reference to its frame;
//! intermediate tables are owned by the address space alone.

use core::cmp::min;

use x86_64::structures::paging::{PageTableFlags, PhysFrame, Size4KiB};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::{PhysAddr, VirtAddr};

use super::cow::resolve_write_fault;
use super::{MemError, PageFrameAllocator, PhysMap, COW, MAX_VA, PAGE_SIZE};

/// Flags for intermediate tables. Leaf entries decide the real permissions.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::from_bits_truncate(
    PageTableFlags::PRESENT.bits()
        | PageTableFlags::WRITABLE.bits()
        | PageTableFlags::USER_ACCESSIBLE.bits(),
);

/// Top-level entries covering the user half.
const USER_P4_ENTRIES: usize = 256;

/// A user address space rooted at a level-4 table.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame<Size4KiB>,
}

impl AddressSpace {
    /// Create an empty address space.
    pub fn new(kmem: &PageFrameAllocator) -> Result<Self, MemError> {
        Ok(AddressSpace {
            root: zeroed_table(kmem)?,
        })
    }

    /// Frame holding the level-4 table (what goes into CR3).
    pub fn root(&self) -> PhysFrame<Size4KiB> {
        self.root
    }

    /// Find the leaf entry for `va`.
    ///
    /// With `alloc` set, missing intermediate tables are created. Returns
    /// `None` if a table is missing (or cannot be allocated), or if `va`
    /// is at or above [`MAX_VA`]. The returned entry may be unused.
    pub fn walk(
        &mut self,
        kmem: &PageFrameAllocator,
        va: VirtAddr,
        alloc: bool,
    ) -> Option<&mut PageTableEntry> {
        // SAFETY: `&mut self` gives exclusive access to this space's tables.
        self.lookup(kmem, va, alloc).map(|entry| unsafe { &mut *entry })
    }

    /// Map the page at `va` to `frame`. `PRESENT` is added to `flags`.
    ///
    /// The caller's reference to `frame` becomes the mapping's reference,
    /// so `frame` must come from `kmem` (`Unmanaged` otherwise).
    pub fn map(
        &mut self,
        kmem: &PageFrameAllocator,
        va: VirtAddr,
        frame: PhysFrame<Size4KiB>,
        flags: PageTableFlags,
    ) -> Result<(), MemError> {
        check_page(va)?;
        if !kmem.manages(frame) {
            return Err(MemError::Unmanaged(frame.start_address().as_u64()));
        }
        let entry = self.walk(kmem, va, true).ok_or(MemError::OutOfMemory)?;
        if entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MemError::AlreadyMapped(va.as_u64()));
        }
        entry.set_frame(frame, flags | PageTableFlags::PRESENT);
        Ok(())
    }

    /// Remove the mapping at `va` and return the frame it pointed to.
    ///
    /// With `free` set, the mapping's reference is dropped.
    pub fn unmap(
        &mut self,
        kmem: &PageFrameAllocator,
        va: VirtAddr,
        free: bool,
    ) -> Result<PhysFrame<Size4KiB>, MemError> {
        check_page(va)?;
        let entry = self
            .walk(kmem, va, false)
            .ok_or(MemError::NotMapped(va.as_u64()))?;
        let frame = entry.frame().map_err(|_| MemError::NotMapped(va.as_u64()))?;
        entry.set_unused();
        if free {
            kmem.free(frame.start_address());
        }
        Ok(frame)
    }

    /// Physical address backing `va`, if mapped.
    pub fn translate(&self, kmem: &PageFrameAllocator, va: VirtAddr) -> Option<PhysAddr> {
        let entry = self.lookup(kmem, va, false)?;
        // SAFETY: read-only use of an entry in a table we own.
        let frame = unsafe { (*entry).frame() }.ok()?;
        Some(frame.start_address() + va.as_u64() % PAGE_SIZE)
    }

    /// Duplicate this address space for a child, sharing every frame.
    ///
    /// Writable (and already copy-on-write) pages become read-only + COW in
    /// both spaces; read-only pages are shared unchanged. Each shared frame
    /// gains one reference. The caller flushes the parent's TLB.
    pub fn duplicate(&mut self, kmem: &PageFrameAllocator) -> Result<AddressSpace, MemError> {
        let mut child = AddressSpace::new(kmem)?;
        let phys = kmem.phys();

        let mut share = |va: VirtAddr, entry: &mut PageTableEntry| -> Result<(), MemError> {
            let frame = entry
                .frame()
                .map_err(|_| MemError::NotMapped(va.as_u64()))?;
            let mut flags = entry.flags();
            if flags.intersects(PageTableFlags::WRITABLE | COW) {
                flags.remove(PageTableFlags::WRITABLE);
                flags.insert(COW);
            }

            let slot = child.walk(kmem, va, true).ok_or(MemError::OutOfMemory)?;
            slot.set_frame(frame, flags);
            entry.set_flags(flags);
            kmem.incref(frame);
            Ok(())
        };

        let result = visit_leaves(phys, self.root, 4, 0, &mut share);
        match result {
            Ok(()) => Ok(child),
            Err(err) => {
                child.destroy(kmem);
                Err(err)
            }
        }
    }

    /// Tear down the space: drop every mapping's reference and free the tables.
    pub fn destroy(self, kmem: &PageFrameAllocator) {
        let phys = kmem.phys();
        let mut release = |_: VirtAddr, entry: &mut PageTableEntry| -> Result<(), MemError> {
            if let Ok(frame) = entry.frame() {
                kmem.free(frame.start_address());
            }
            entry.set_unused();
            Ok(())
        };
        let unmapped = visit_leaves(phys, self.root, 4, 0, &mut release);
        debug_assert!(unmapped.is_ok());
        free_tables(kmem, self.root, 4);
    }

    /// Copy `bytes` into user memory at `va`, un-sharing COW pages first.
    pub fn copy_out(
        &mut self,
        kmem: &PageFrameAllocator,
        va: VirtAddr,
        bytes: &[u8],
    ) -> Result<(), MemError> {
        let mut addr = va.as_u64();
        let mut src = bytes;
        while !src.is_empty() {
            let page = user_page(addr)?;
            let offset = (addr - page.as_u64()) as usize;
            let n = min(PAGE_SIZE as usize - offset, src.len());

            let flags = self.leaf_flags(kmem, page)?;
            if flags.contains(COW) {
                resolve_write_fault(kmem, self, page)?;
            } else if !flags.contains(PageTableFlags::WRITABLE) {
                return Err(MemError::NotCow(page.as_u64()));
            }

            let frame = self.leaf_frame(kmem, page)?;
            // SAFETY: the frame is mapped writable in this space only.
            let dst = unsafe { kmem.phys().bytes_mut(frame) };
            dst[offset..offset + n].copy_from_slice(&src[..n]);

            src = &src[n..];
            addr += n as u64;
        }
        Ok(())
    }

    /// Copy user memory at `va` into `buf`.
    pub fn copy_in(
        &self,
        kmem: &PageFrameAllocator,
        va: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), MemError> {
        let mut addr = va.as_u64();
        let mut done = 0;
        while done < buf.len() {
            let page = user_page(addr)?;
            let offset = (addr - page.as_u64()) as usize;
            let n = min(PAGE_SIZE as usize - offset, buf.len() - done);

            self.leaf_flags(kmem, page)?;
            let frame = self.leaf_frame(kmem, page)?;
            // SAFETY: shared read of a mapped frame.
            let src = unsafe { kmem.phys().bytes(frame) };
            buf[done..done + n].copy_from_slice(&src[offset..offset + n]);

            done += n;
            addr += n as u64;
        }
        Ok(())
    }

    fn lookup(
        &self,
        kmem: &PageFrameAllocator,
        va: VirtAddr,
        alloc: bool,
    ) -> Option<*mut PageTableEntry> {
        if va.as_u64() >= MAX_VA {
            return None;
        }
        let phys = kmem.phys();
        // SAFETY: `root` and every table reached from it are frames owned
        // by this address space.
        let mut table = unsafe { phys.table(self.root) };
        for index in [va.p4_index(), va.p3_index(), va.p2_index()] {
            let entry = &mut table[index];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                if !alloc {
                    return None;
                }
                let frame = zeroed_table(kmem).ok()?;
                entry.set_frame(frame, TABLE_FLAGS);
            }
            table = unsafe { phys.table(entry.frame().ok()?) };
        }
        Some(&mut table[va.p1_index()] as *mut PageTableEntry)
    }

    /// Flags of a present, user-accessible leaf.
    fn leaf_flags(&self, kmem: &PageFrameAllocator, page: VirtAddr) -> Result<PageTableFlags, MemError> {
        let entry = self
            .lookup(kmem, page, false)
            .ok_or(MemError::NotMapped(page.as_u64()))?;
        // SAFETY: read-only use of an entry in a table we own.
        let flags = unsafe { (*entry).flags() };
        if !flags.contains(PageTableFlags::PRESENT) {
            return Err(MemError::NotMapped(page.as_u64()));
        }
        if !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
            return Err(MemError::NotUser(page.as_u64()));
        }
        Ok(flags)
    }

    fn leaf_frame(&self, kmem: &PageFrameAllocator, page: VirtAddr) -> Result<PhysFrame<Size4KiB>, MemError> {
        let entry = self
            .lookup(kmem, page, false)
            .ok_or(MemError::NotMapped(page.as_u64()))?;
        // SAFETY: as above.
        unsafe { (*entry).frame() }.map_err(|_| MemError::NotMapped(page.as_u64()))
    }
}

fn check_page(va: VirtAddr) -> Result<(), MemError> {
    if va.as_u64() >= MAX_VA {
        return Err(MemError::AddressTooHigh(va.as_u64()));
    }
    if !va.is_aligned(PAGE_SIZE) {
        return Err(MemError::Misaligned(va.as_u64()));
    }
    Ok(())
}

/// Page containing `addr`, which must lie below [`MAX_VA`].
fn user_page(addr: u64) -> Result<VirtAddr, MemError> {
    if addr >= MAX_VA {
        return Err(MemError::AddressTooHigh(addr));
    }
    Ok(VirtAddr::new(addr - addr % PAGE_SIZE))
}

fn zeroed_table(kmem: &PageFrameAllocator) -> Result<PhysFrame<Size4KiB>, MemError> {
    let frame = kmem.alloc().ok_or(MemError::OutOfMemory)?;
    // SAFETY: freshly allocated, not yet reachable from any table.
    unsafe { kmem.phys().table(frame).zero() };
    Ok(frame)
}

/// Call `f` on every present leaf under `table`, lowest address first.
///
/// `level` is 4 for the root; only the user half of the root is visited.
fn visit_leaves(
    phys: PhysMap,
    table: PhysFrame<Size4KiB>,
    level: u8,
    base: u64,
    f: &mut dyn FnMut(VirtAddr, &mut PageTableEntry) -> Result<(), MemError>,
) -> Result<(), MemError> {
    // SAFETY: tables reachable from a root belong to that address space.
    let entries = unsafe { phys.table(table) };
    let span = PAGE_SIZE << (9 * (level as u64 - 1));
    let limit = if level == 4 { USER_P4_ENTRIES } else { 512 };

    for (i, entry) in entries.iter_mut().enumerate().take(limit) {
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let va = base + i as u64 * span;
        if level == 1 {
            f(VirtAddr::new(va), entry)?;
        } else if let Ok(next) = entry.frame() {
            visit_leaves(phys, next, level - 1, va, f)?;
        }
    }
    Ok(())
}

/// Free `table` and every table below it. Leaves must already be unused.
///
/// Kernel-half entries of the root are shared with every other space and
/// are left alone.
fn free_tables(kmem: &PageFrameAllocator, table: PhysFrame<Size4KiB>, level: u8) {
    if level > 1 {
        // SAFETY: as in `visit_leaves`.
        let entries = unsafe { kmem.phys().table(table) };
        let limit = if level == 4 { USER_P4_ENTRIES } else { 512 };
        for entry in entries.iter_mut().take(limit) {
            if let Ok(next) = entry.frame() {
                free_tables(kmem, next, level - 1);
                entry.set_unused();
            }
        }
    }
    kmem.free(table.start_address());
}
