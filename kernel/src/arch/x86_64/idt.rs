// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt::DOUBLE_FAULT_IST_INDEX;
use super::trap;

fn stub_addr(f: unsafe extern "C" fn()) -> VirtAddr {
    VirtAddr::new(f as usize as u64)
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // SAFETY: every stub pushes a uniform trap frame and returns with
        // iretq; the addresses are real function entry points.
        unsafe {
            idt.divide_error.set_handler_addr(stub_addr(trap::trap_divide_error));
            idt.debug.set_handler_addr(stub_addr(trap::trap_debug));
            idt.non_maskable_interrupt.set_handler_addr(stub_addr(trap::trap_nmi));
            idt.breakpoint.set_handler_addr(stub_addr(trap::trap_breakpoint));
            idt.overflow.set_handler_addr(stub_addr(trap::trap_overflow));
            idt.bound_range_exceeded.set_handler_addr(stub_addr(trap::trap_bound_range));
            idt.invalid_opcode.set_handler_addr(stub_addr(trap::trap_invalid_opcode));
            idt.device_not_available.set_handler_addr(stub_addr(trap::trap_device_na));
            idt.double_fault
                .set_handler_addr(stub_addr(trap::trap_double_fault))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub_addr(trap::trap_invalid_tss));
            idt.segment_not_present.set_handler_addr(stub_addr(trap::trap_segment_np));
            idt.stack_segment_fault.set_handler_addr(stub_addr(trap::trap_stack_segment));
            idt.general_protection_fault
                .set_handler_addr(stub_addr(trap::trap_general_protection));
            idt.page_fault.set_handler_addr(stub_addr(trap::trap_page_fault));
            idt.x87_floating_point.set_handler_addr(stub_addr(trap::trap_x87));
            idt.alignment_check.set_handler_addr(stub_addr(trap::trap_alignment_check));
            idt.machine_check.set_handler_addr(stub_addr(trap::trap_machine_check));
            idt.simd_floating_point.set_handler_addr(stub_addr(trap::trap_simd));

            // User-accessible syscall gate.
            idt[trap::TRAP_SYSCALL as u8]
                .set_handler_addr(stub_addr(trap::trap_syscall_gate))
                .set_privilege_level(PrivilegeLevel::Ring3);

            // Core-halt inter-processor gate.
            idt[trap::HALT_VECTOR as u8].set_handler_addr(stub_addr(trap::trap_halt_ipi));

            // Per-core interval timer and the LAPIC spurious vector.
            idt[trap::SCHED_TIMER_VECTOR as u8]
                .set_handler_addr(stub_addr(trap::trap_sched_timer));
            idt[trap::SPURIOUS_VECTOR as u8].set_handler_addr(stub_addr(trap::trap_spurious));

            // Externally routed interrupt pool.
            for &(vector, stub) in trap::POOL_STUBS {
                idt[vector].set_handler_addr(stub_addr(stub));
            }
        }

        idt
    };
}

/// Load the shared vector table on the calling core.
pub fn load() {
    IDT.load();
}
