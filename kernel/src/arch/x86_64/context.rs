//! Context entry
//!
//! Restoring a saved trap frame is the one place the kernel deliberately
//! downgrades privilege without an inbound trap to unwind: the frame is
//! replayed through the same register-pop/iretq tail the trap stubs use.

use alloc::sync::Arc;
use core::arch::asm;

use super::apic;
use super::trap::TrapFrame;
use crate::process::Process;
use crate::sched::SCHED_QUANTUM_US;

/// Resume execution of a saved trap frame. Interrupts must be disabled;
/// the frame is consumed in place.
///
/// # Safety
///
/// The frame must describe a resumable context: valid selectors, a mapped
/// stack and instruction pointer in the active address space.
pub unsafe fn enter_frame(tf: &TrapFrame) -> ! {
    // SAFETY: rsp is pointed at the frame so the pop sequence walks its
    // fields in order; iretq consumes the tail. The per-CPU base is
    // swapped only when the frame returns to ring 3.
    unsafe {
        asm!(
            "mov rsp, rdi",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rbp",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "add rsp, 16",
            "test byte ptr [rsp + 8], 3",
            "jz 2f",
            "swapgs",
            "2:",
            "iretq",
            in("rdi") tf,
            options(noreturn)
        )
    }
}

/// Kick a process into its user context: load its address space, arm the
/// quantum timer, and replay its saved frame.
///
/// # Safety
///
/// The process must be fully initialized (VAS, stack, entry point) and be
/// this core's current process.
pub unsafe fn kick(proc: &Arc<Process>) -> ! {
    x86_64::instructions::interrupts::disable();

    let (vas, tf) = {
        let pcb = proc.pcb.lock();
        (pcb.vas, pcb.tf)
    };

    // SAFETY: the process VAS shares the kernel half with the boot VAS.
    unsafe { vas.load() };
    apic::timer_oneshot_us(SCHED_QUANTUM_US);
    // SAFETY: frame was seeded by proc_init / saved by the preemption path.
    unsafe { enter_frame(&tf) }
}
