//! Virtual address spaces
//!
//! A `Vas` owns the root of one 4-level translation tree plus the register
//! value that activates it. The kernel VAS lives for the whole boot; each
//! process exclusively owns one user VAS whose kernel half aliases the boot
//! mappings.

use bitflags::bitflags;
use spin::Once;
use x86_64::structures::paging::PageTableFlags;

use super::{align_down, align_up, page_table, vm_alloc_frame, vm_free_frame, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Mapping protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

impl Protection {
    /// Lower to hardware page-table entry flags. `EXEC` without `READ` is
    /// representable since NX only gates instruction fetch.
    pub fn to_pte_flags(self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if self.contains(Protection::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.contains(Protection::USER) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if !self.contains(Protection::EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }
}

/// Mapping specifier: a (virtual, physical) address pair. A zero physical
/// address asks the mapper to allocate backing frames; a zero virtual
/// address means identity (virt = phys). Both fields are page-aligned and
/// nonzero after a successful map.
#[derive(Debug, Clone, Copy)]
pub struct MapSpec {
    pub virt: u64,
    pub phys: u64,
}

impl MapSpec {
    pub const fn new(virt: u64, phys: u64) -> Self {
        Self { virt, phys }
    }
}

/// One virtual address space: the root translation-table frame, whose
/// physical address doubles as the CR3 value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vas {
    root: u64,
}

static BOOT_VAS: Once<u64> = Once::new();

impl Vas {
    /// Wrap an existing root-table physical address.
    pub const fn from_raw(root: u64) -> Vas {
        Vas { root }
    }

    /// Physical address of the root table.
    pub fn root(&self) -> u64 {
        self.root
    }

    /// The address space the bootloader handed us. All kernel-half
    /// mappings originate here.
    pub fn boot() -> Vas {
        Vas {
            root: *BOOT_VAS
                .get()
                .unwrap_or_else(|| panic!("vas: boot VAS not recorded")),
        }
    }

    /// The currently active address space.
    #[cfg(target_os = "none")]
    pub fn current() -> Vas {
        use x86_64::registers::control::Cr3;
        let (frame, _) = Cr3::read();
        Vas {
            root: frame.start_address().as_u64(),
        }
    }

    /// Activate this address space.
    ///
    /// # Safety
    ///
    /// The root table must map the kernel half, including the code
    /// currently executing.
    #[cfg(target_os = "none")]
    pub unsafe fn load(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;

        let frame = PhysFrame::containing_address(PhysAddr::new(self.root));
        // SAFETY: caller guarantees the root maps the running kernel.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    /// Create a fresh address space: a new root table whose kernel half is
    /// copied from the boot VAS.
    pub fn new() -> KernelResult<Vas> {
        let root = vm_alloc_frame(1);
        if root == 0 {
            return Err(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
            });
        }
        page_table::copy_kernel_half(root, Vas::boot().root);
        Ok(Vas { root })
    }

    /// Tear down the user half of this address space: every translation
    /// table below the kernel split goes back to the frame allocator, then
    /// the root itself. Leaf frames are the range list's responsibility.
    pub fn free(self) {
        page_table::free_user_tables(self.root);
        vm_free_frame(self.root, 1);
    }
}

/// Record the active address space as the boot VAS. Called once from
/// `mm::init` on the bootstrap processor.
#[cfg(target_os = "none")]
pub fn record_boot_vas() {
    BOOT_VAS.call_once(|| Vas::current().root);
}

/// Record an arbitrary root as the boot VAS (host-test hook).
#[cfg(not(target_os = "none"))]
pub fn record_boot_vas_raw(root: u64) {
    BOOT_VAS.call_once(|| root);
}

/// Normalize a map request: round the length, resolve zero fields of the
/// specifier, and align both addresses down to page boundaries. Returns
/// the page count and whether backing frames were allocated here.
fn normalize(spec: &mut MapSpec, len: usize) -> KernelResult<(usize, bool)> {
    if len == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let len = align_up(len as u64, PAGE_SIZE as u64) as usize;
    let pages = len / PAGE_SIZE;
    let mut allocated = false;

    if spec.phys == 0 {
        spec.phys = vm_alloc_frame(pages);
        if spec.phys == 0 {
            return Err(KernelError::OutOfMemory { requested: len });
        }
        allocated = true;
    }
    if spec.virt == 0 {
        spec.virt = spec.phys;
    }

    spec.virt = align_down(spec.virt, PAGE_SIZE as u64);
    spec.phys = align_down(spec.phys, PAGE_SIZE as u64);
    Ok((pages, allocated))
}

/// Create a virtual-to-physical mapping of `len` bytes on behalf of
/// `target` (the owner the range is recorded against, when the mapping is
/// user-visible).
///
/// On any mid-loop failure the partially installed region is unmapped (and
/// backing frames allocated here are released) before the error returns.
/// After success a single guard entry denying all access sits at
/// `spec.virt + len`.
pub fn vm_map_for(
    vas: &Vas,
    spec: &mut MapSpec,
    len: usize,
    prot: Protection,
    target: Option<&alloc::sync::Arc<crate::process::Process>>,
) -> KernelResult<()> {
    let (pages, allocated) = normalize(spec, len)?;
    let flags = prot.to_pte_flags();

    // Unwind a partial mapping so a failed map leaves nothing behind.
    let rollback = |mapped: usize| {
        for j in 0..mapped {
            let _ = page_table::unmap_single(vas.root, spec.virt + (j * PAGE_SIZE) as u64);
        }
        if allocated {
            vm_free_frame(spec.phys, pages);
        }
    };

    for i in 0..pages {
        let va = spec.virt + (i * PAGE_SIZE) as u64;
        let pa = spec.phys + (i * PAGE_SIZE) as u64;
        if let Err(err) = page_table::map_single(vas.root, va, pa, flags) {
            log::warn!("vm_map: could not map {:#x}", va);
            rollback(i);
            return Err(err);
        }
    }

    // Guard page at the end of the region. No mapping is complete (or
    // recorded) without one, so a guard failure unwinds the whole region.
    if let Err(err) = page_table::install_guard(vas.root, spec.virt + (pages * PAGE_SIZE) as u64) {
        log::warn!("vm_map: could not place guard after {:#x}", spec.virt);
        rollback(pages);
        return Err(err);
    }

    // Record the range for teardown against its owner.
    if prot.contains(Protection::USER) {
        if let Some(proc) = target {
            proc.add_range(spec.virt, spec.phys, pages * PAGE_SIZE);
        }
    }
    Ok(())
}

/// `vm_map_for` with the calling process as the range owner.
pub fn vm_map(vas: &Vas, spec: &mut MapSpec, len: usize, prot: Protection) -> KernelResult<()> {
    let current = crate::process::current();
    vm_map_for(vas, spec, len, prot, current.as_ref())
}

/// Remove a mapping of `len` bytes at `virt`. Missing entries are skipped.
pub fn vm_unmap(vas: &Vas, virt: u64, len: usize) {
    let virt = align_down(virt, PAGE_SIZE as u64);
    let len = align_up(len as u64, PAGE_SIZE as u64) as usize;
    for i in 0..len / PAGE_SIZE {
        let _ = page_table::unmap_single(vas.root, virt + (i * PAGE_SIZE) as u64);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn protection_lowering() {
        let rw = Protection::READ | Protection::WRITE;
        let flags = rw.to_pte_flags();
        assert!(flags.contains(PageTableFlags::PRESENT));
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(!flags.contains(PageTableFlags::USER_ACCESSIBLE));

        let rx_user = Protection::READ | Protection::EXEC | Protection::USER;
        let flags = rx_user.to_pte_flags();
        assert!(!flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
    }

    #[test]
    fn normalize_identity_defaults_virt_to_phys() {
        let mut spec = MapSpec::new(0, 0x5000);
        let (pages, allocated) = normalize(&mut spec, 0x1800).expect("normalize should succeed");
        assert_eq!(spec.virt, 0x5000, "zero virt means identity");
        assert_eq!(pages, 2, "length rounds up to pages");
        assert!(!allocated);
    }

    #[test]
    fn normalize_aligns_addresses_down() {
        let mut spec = MapSpec::new(0x7fff, 0x5123);
        let (pages, _) = normalize(&mut spec, 42).expect("normalize should succeed");
        assert_eq!(spec.virt, 0x7000);
        assert_eq!(spec.phys, 0x5000);
        assert_eq!(pages, 1);
    }

    #[test]
    fn normalize_rejects_empty_request() {
        let mut spec = MapSpec::new(0x1000, 0x1000);
        assert_eq!(
            normalize(&mut spec, 0),
            Err(KernelError::InvalidArgument)
        );
    }
}
