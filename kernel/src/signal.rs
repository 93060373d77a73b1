//! Process signal tables
//!
//! Each process carries a fixed table of signal actions manipulated with
//! the `sigaction` syscall. Installation and bounds checks are complete;
//! asynchronous delivery is a stub in this core.

use crate::error::{Errno, KernelError, KernelResult};
use crate::mm::user_validation::{copyin_value, copyout_value};
use crate::syscall::SyscallArgs;

/// Number of signal slots per process.
pub const NSIG: usize = 32;

/// One installed signal action.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigAction {
    /// User handler entry point; 0 is the default action.
    pub handler: u64,
    /// Behavior flags (reserved).
    pub flags: u64,
}

/// Per-process signal table.
pub type SigTable = [SigAction; NSIG];

/// Install `act` for signal `sig`, returning the previous action.
pub fn do_sigaction(
    sigtab: &mut SigTable,
    sig: usize,
    act: Option<SigAction>,
) -> KernelResult<SigAction> {
    if sig >= NSIG {
        return Err(KernelError::InvalidArgument);
    }
    let old = sigtab[sig];
    if let Some(act) = act {
        sigtab[sig] = act;
    }
    Ok(old)
}

/// sigaction syscall.
///
/// ARG0: signal number
/// ARG1: new action (may be null)
/// ARG2: old action result (may be null)
pub fn sys_sigaction(args: &mut SyscallArgs) -> isize {
    let sig = args.arg(0) as usize;
    let u_act = args.arg(1);
    let u_oact = args.arg(2);

    let Some(proc) = crate::process::current() else {
        return Errno::Srch.as_ret();
    };

    let act = if u_act != 0 {
        match copyin_value::<SigAction>(u_act) {
            Ok(a) => Some(a),
            Err(e) => return Errno::from(e).as_ret(),
        }
    } else {
        None
    };

    let old = {
        let mut sigtab = proc.sigtab.lock();
        match do_sigaction(&mut sigtab, sig, act) {
            Ok(old) => old,
            Err(e) => return Errno::from(e).as_ret(),
        }
    };

    if u_oact != 0 {
        if let Err(e) = copyout_value(&old, u_oact) {
            return Errno::from(e).as_ret();
        }
    }
    0
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn sigaction_roundtrip_and_bounds() {
        let mut tab: SigTable = [SigAction::default(); NSIG];

        let act = SigAction {
            handler: 0x400100,
            flags: 0,
        };
        let old = do_sigaction(&mut tab, 5, Some(act)).expect("valid signal number");
        assert_eq!(old, SigAction::default());

        let now = do_sigaction(&mut tab, 5, None).expect("query should succeed");
        assert_eq!(now, act);

        assert_eq!(
            do_sigaction(&mut tab, NSIG, Some(act)),
            Err(KernelError::InvalidArgument),
            "out-of-range signal must be refused"
        );
    }
}
