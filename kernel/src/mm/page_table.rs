//! Page-table plumbing
//!
//! Manual 4-level table walks over the bootloader's higher-half physical
//! mapping: single-page map/unmap, guard entries, kernel-half duplication
//! for fresh roots, and teardown of user-half translation tables.

use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::PhysAddr;

use super::{phys_to_virt, vm_alloc_frame, vm_free_frame, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Index of the first kernel-half entry in the root table.
pub const KERNEL_SPLIT_L4: usize = 256;

/// Verify the processor is running 4-level paging. This kernel does not
/// implement 5-level translation; being handed LA57 is unrecoverable.
pub fn paging_sanity_gate() {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::{Cr4, Cr4Flags};
        if Cr4::read().contains(Cr4Flags::L5_PAGING) {
            panic!("mmu: processor not using 4-level paging");
        }
    }
}

fn l4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

fn l3_index(va: u64) -> usize {
    ((va >> 30) & 0x1FF) as usize
}

fn l2_index(va: u64) -> usize {
    ((va >> 21) & 0x1FF) as usize
}

fn l1_index(va: u64) -> usize {
    ((va >> 12) & 0x1FF) as usize
}

/// View a physical table frame as a `PageTable`.
///
/// # Safety
///
/// `pa` must be the physical base of a live page-table frame owned by the
/// caller's address space.
unsafe fn table_at(pa: u64) -> &'static mut PageTable {
    // SAFETY: caller guarantees `pa` addresses a page-table frame; the
    // higher-half mapping covers all physical memory.
    unsafe { &mut *(phys_to_virt(pa) as *mut PageTable) }
}

/// Walk one level down, allocating the next table if `create` is set.
/// Intermediate entries inherit `USER_ACCESSIBLE` from the leaf request so
/// user-half translations stay reachable from ring 3.
fn descend(table: &mut PageTable, index: usize, create: bool, user: bool) -> KernelResult<u64> {
    let entry = &mut table[index];

    if entry.is_unused() {
        if !create {
            return Err(KernelError::NotFound);
        }
        let frame = vm_alloc_frame(1);
        if frame == 0 {
            return Err(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
            });
        }
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        entry.set_addr(PhysAddr::new(frame), flags);
        return Ok(frame);
    }

    if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
        let flags = entry.flags() | PageTableFlags::USER_ACCESSIBLE;
        entry.set_flags(flags);
    }
    Ok(entry.addr().as_u64())
}

/// Install one leaf entry `va -> pa` with the given flags in the tree
/// rooted at `root` (physical address of the L4 table).
pub fn map_single(root: u64, va: u64, pa: u64, flags: PageTableFlags) -> KernelResult<()> {
    let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);

    // SAFETY: `root` is the caller's live L4 frame.
    let l4 = unsafe { table_at(root) };
    let l3_pa = descend(l4, l4_index(va), true, user)?;
    // SAFETY: `l3_pa` was either read from a present entry or just allocated.
    let l3 = unsafe { table_at(l3_pa) };
    let l2_pa = descend(l3, l3_index(va), true, user)?;
    // SAFETY: as above.
    let l2 = unsafe { table_at(l2_pa) };
    let l1_pa = descend(l2, l2_index(va), true, user)?;
    // SAFETY: as above.
    let l1 = unsafe { table_at(l1_pa) };

    l1[l1_index(va)].set_addr(PhysAddr::new(pa), flags);
    Ok(())
}

/// Install a guard entry at `va`: the slot exists but denies every access
/// (no PRESENT bit), so touching the page faults immediately.
pub fn install_guard(root: u64, va: u64) -> KernelResult<()> {
    // SAFETY: `root` is the caller's live L4 frame.
    let l4 = unsafe { table_at(root) };
    let l3_pa = descend(l4, l4_index(va), true, true)?;
    // SAFETY: present-or-fresh table frame, as in `map_single`.
    let l3 = unsafe { table_at(l3_pa) };
    let l2_pa = descend(l3, l3_index(va), true, true)?;
    // SAFETY: as above.
    let l2 = unsafe { table_at(l2_pa) };
    let l1_pa = descend(l2, l2_index(va), true, true)?;
    // SAFETY: as above.
    let l1 = unsafe { table_at(l1_pa) };

    l1[l1_index(va)].set_unused();
    Ok(())
}

/// Remove the leaf entry for `va`, returning the physical address it
/// pointed at.
pub fn unmap_single(root: u64, va: u64) -> KernelResult<u64> {
    // SAFETY: `root` is the caller's live L4 frame.
    let l4 = unsafe { table_at(root) };
    let l3_pa = descend(l4, l4_index(va), false, false)?;
    // SAFETY: entry was present.
    let l3 = unsafe { table_at(l3_pa) };
    let l2_pa = descend(l3, l3_index(va), false, false)?;
    // SAFETY: as above.
    let l2 = unsafe { table_at(l2_pa) };
    let l1_pa = descend(l2, l2_index(va), false, false)?;
    // SAFETY: as above.
    let l1 = unsafe { table_at(l1_pa) };

    let entry = &mut l1[l1_index(va)];
    if entry.is_unused() {
        return Err(KernelError::NotFound);
    }
    let pa = entry.addr().as_u64();
    entry.set_unused();
    Ok(pa)
}

/// Resolve `va` to a physical address in the tree rooted at `root`.
pub fn translate(root: u64, va: u64) -> Option<u64> {
    // SAFETY: `root` is the caller's live L4 frame; the walk only reads.
    let l4 = unsafe { table_at(root) };
    if l4[l4_index(va)].is_unused() {
        return None;
    }
    let mut pa = l4[l4_index(va)].addr().as_u64();

    // SAFETY: present entry read above.
    let l3 = unsafe { table_at(pa) };
    if l3[l3_index(va)].is_unused() {
        return None;
    }
    pa = l3[l3_index(va)].addr().as_u64();

    // SAFETY: as above.
    let l2 = unsafe { table_at(pa) };
    if l2[l2_index(va)].is_unused() {
        return None;
    }
    pa = l2[l2_index(va)].addr().as_u64();

    // SAFETY: as above.
    let l1 = unsafe { table_at(pa) };
    let entry = &l1[l1_index(va)];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(entry.addr().as_u64() + (va & (PAGE_SIZE as u64 - 1)))
}

/// Copy the kernel-half entries of `src_root` into `dst_root`, so every
/// address space shares the same kernel mappings.
pub fn copy_kernel_half(dst_root: u64, src_root: u64) {
    // SAFETY: both roots are live L4 frames; only upper-half entries are
    // touched and the source is not modified.
    let (dst, src) = unsafe { (table_at(dst_root), table_at(src_root)) };
    for i in KERNEL_SPLIT_L4..512 {
        dst[i].set_addr(src[i].addr(), src[i].flags());
    }
}

/// Free every translation-table page below the kernel split. Leaf frames
/// are not touched -- those are owned by the process range list.
pub fn free_user_tables(root: u64) {
    // SAFETY: `root` is the dying address space's L4 frame; nothing runs
    // on it anymore.
    let l4 = unsafe { table_at(root) };
    for l4e in l4.iter().take(KERNEL_SPLIT_L4) {
        if l4e.is_unused() {
            continue;
        }
        let l3_pa = l4e.addr().as_u64();
        // SAFETY: present entry.
        let l3 = unsafe { table_at(l3_pa) };
        for l3e in l3.iter() {
            if l3e.is_unused() {
                continue;
            }
            let l2_pa = l3e.addr().as_u64();
            // SAFETY: present entry.
            let l2 = unsafe { table_at(l2_pa) };
            for l2e in l2.iter() {
                if !l2e.is_unused() {
                    vm_free_frame(l2e.addr().as_u64(), 1);
                }
            }
            vm_free_frame(l2_pa, 1);
        }
        vm_free_frame(l3_pa, 1);
    }
}
