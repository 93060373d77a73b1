//! Per-core descriptor tables
//!
//! Every core owns its GDT and TSS inside its per-core descriptor; the
//! layout (and the SYSRET-compatible user segment ordering) is fixed:
//!
//! - 0x00: Null descriptor
//! - 0x08: Kernel code segment (Ring 0)
//! - 0x10: Kernel data segment (Ring 0)
//! - 0x18: TSS (occupies 2 entries, 0x18-0x20)
//! - 0x28: User data segment (Ring 3, selector 0x2B with RPL)
//! - 0x30: User code segment (Ring 3, selector 0x33 with RPL)

use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::mm::{phys_to_virt, vm_alloc_frame, PAGE_SIZE};

/// IST slot used by the double-fault gate.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Kernel code selector value.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector value.
pub const KERNEL_DS: u16 = 0x10;
/// User data selector with RPL 3.
pub const USER_DS: u16 = 0x28 | 3;
/// User code selector with RPL 3.
pub const USER_CS: u16 = 0x30 | 3;

/// Kernel stack size for ring transitions: 4 pages.
const KSTACK_PAGES: usize = 4;
/// Dedicated double-fault stack: 2 pages.
const DF_STACK_PAGES: usize = 2;

/// Selectors appended to a core's GDT.
#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub code: SegmentSelector,
    pub data: SegmentSelector,
    pub tss: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
}

/// Allocate a kernel stack and return its (16-byte aligned) top.
fn alloc_stack(pages: usize) -> u64 {
    let base = vm_alloc_frame(pages);
    if base == 0 {
        panic!("gdt: could not allocate kernel stack");
    }
    phys_to_virt(base) as u64 + (pages * PAGE_SIZE) as u64
}

/// Build and load this core's GDT and TSS.
///
/// # Safety
///
/// `gdt` and `tss` must live inside a leaked per-core descriptor (they are
/// referenced by the hardware for the core's lifetime), and this must run
/// on the core the tables belong to.
pub unsafe fn init_core_tables(
    gdt: &'static mut GlobalDescriptorTable,
    tss: &'static mut TaskStateSegment,
) -> Selectors {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::instructions::tables::load_tss;

    tss.privilege_stack_table[0] = VirtAddr::new(alloc_stack(KSTACK_PAGES));
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
        VirtAddr::new(alloc_stack(DF_STACK_PAGES));

    let code = gdt.append(Descriptor::kernel_code_segment());
    let data = gdt.append(Descriptor::kernel_data_segment());
    // SAFETY: `tss` is leaked per-core state; the reference stays valid for
    // as long as the descriptor that the hardware caches.
    let tss_sel = gdt.append(Descriptor::tss_segment(unsafe {
        &*(tss as *const TaskStateSegment)
    }));
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());

    // Give up the unique borrow; the hardware holds the table from here on.
    let gdt: &'static GlobalDescriptorTable = gdt;
    gdt.load();
    // SAFETY: the selectors reference descriptors in the GDT loaded above.
    unsafe {
        CS::set_reg(code);
        DS::set_reg(data);
        ES::set_reg(data);
        SS::set_reg(data);
        load_tss(tss_sel);
    }

    Selectors {
        code,
        data,
        tss: tss_sel,
        user_data,
        user_code,
    }
}
