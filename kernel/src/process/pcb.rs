//! Process control block
//!
//! The machine-dependent slice of a process: the saved trap frame that a
//! future return-to-user replays, and the owned user address space.

use crate::arch::x86_64::trap::TrapFrame;
use crate::mm::Vas;

/// Machine-dependent process state.
pub struct MdPcb {
    /// Saved processor state; restored verbatim on the next run.
    pub tf: TrapFrame,
    /// The process's exclusively owned address space.
    pub vas: Vas,
}

impl MdPcb {
    pub const fn empty() -> Self {
        Self {
            tf: TrapFrame {
                r15: 0,
                r14: 0,
                r13: 0,
                r12: 0,
                r11: 0,
                r10: 0,
                r9: 0,
                r8: 0,
                rbp: 0,
                rdi: 0,
                rsi: 0,
                rdx: 0,
                rcx: 0,
                rbx: 0,
                rax: 0,
                trapno: 0,
                error_code: 0,
                rip: 0,
                cs: 0,
                rflags: 0,
                rsp: 0,
                ss: 0,
            },
            vas: Vas::from_raw(0),
        }
    }
}
