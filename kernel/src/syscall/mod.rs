//! Syscall dispatch
//!
//! The user gate funnels here with a full trap frame. Dispatch resolves
//! the current core, the current process, its syscall domain, and the
//! window the platform latch selects; the call number in RAX then indexes
//! that window's table. Arguments ride in the six argument registers of
//! the platform C convention, and the return value goes back out in RAX
//! (negative values in [-4095, -1] are error numbers).

pub mod domain;
pub mod native;
pub mod unix;

use crate::arch::x86_64::trap::TrapFrame;
use crate::error::Errno;

/// Register arguments plus the originating trap frame.
pub struct SyscallArgs<'a> {
    args: [u64; 6],
    pub tf: &'a mut TrapFrame,
}

impl<'a> SyscallArgs<'a> {
    /// Fetch argument `n` (0..=5).
    pub fn arg(&self, n: usize) -> u64 {
        self.args[n]
    }
}

/// Syscall handler signature.
pub type Sccb = fn(&mut SyscallArgs) -> isize;

/// Byte length of the user gate instruction (`int imm8`). A blocking call
/// that parks its caller rewinds the saved instruction pointer by this
/// much, so the process restarts the syscall when it is rescheduled.
pub const SYSCALL_INSN_LEN: u64 = 2;

/// High-level syscall entry, called from the trap path.
pub fn dispatch(tf: &mut TrapFrame) {
    let Some(core) = crate::arch::x86_64::percpu::this_core() else {
        log::warn!("syscall: no core state");
        return;
    };
    let Some(proc) = core.curproc() else {
        log::warn!("syscall: no current process");
        return;
    };

    let platch = proc.scdom.platch();
    let Some(win) = proc.scdom.window(platch) else {
        log::warn!("syscall: no window (platch={:#x})", platch);
        return;
    };
    // An absent window is a policy decision, not an error: the process
    // may be mid-reconfiguration. Leave the frame untouched.
    if !win.present {
        log::warn!("syscall: no sctab (platch={:#x})", platch);
        return;
    }

    let callno = tf.rax as usize;
    if callno == 0 || callno >= win.nimpl {
        tf.rax = Errno::NotSup.as_ret() as u64;
        return;
    }
    let Some(handler) = win.table[callno] else {
        tf.rax = Errno::NotSup.as_ret() as u64;
        return;
    };

    let mut args = SyscallArgs {
        args: [tf.rdi, tf.rsi, tf.rdx, tf.r10, tf.r9, tf.r8],
        tf,
    };
    let ret = handler(&mut args);
    args.tf.rax = ret as u64;
}
