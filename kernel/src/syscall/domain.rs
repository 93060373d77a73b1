//! Syscall domains and windows
//!
//! A process's syscall domain is a fixed array of windows plus a sliding
//! index, the platform latch. Each window presents one ABI (the UNIX-like
//! surface or the native one) through its own table; the tables are
//! immutable after kernel init, only the latch moves. The latch-slide
//! call sits at the same index in every window, so a process can always
//! reach it whichever ABI it currently presents.

use core::sync::atomic::{AtomicU8, Ordering};

use super::{Sccb, SyscallArgs};
use crate::error::{Errno, KernelError, KernelResult};

/// Number of windows in a domain.
pub const SCWIN_MAX: usize = 2;

/// Valid platform latch positions.
pub const PLATCH_UNIX: u8 = 0;
pub const PLATCH_NATIVE: u8 = 1;

/// The slide call's index, identical in every installed window.
pub const SYS_SCSLIDE: usize = 17;

/// One installed syscall table.
#[derive(Clone, Copy)]
pub struct SyscallWin {
    pub table: &'static [Option<Sccb>],
    pub nimpl: usize,
    pub present: bool,
}

/// A process's collection of windows plus its current latch.
pub struct SyscallDomain {
    slots: [SyscallWin; SCWIN_MAX],
    platch: AtomicU8,
}

impl SyscallDomain {
    /// Fresh domain: both stock windows installed, latch on the UNIX
    /// window.
    pub fn new() -> Self {
        Self {
            slots: [
                SyscallWin {
                    table: super::unix::table(),
                    nimpl: super::unix::table().len(),
                    present: true,
                },
                SyscallWin {
                    table: super::native::table(),
                    nimpl: super::native::table().len(),
                    present: true,
                },
            ],
            platch: AtomicU8::new(PLATCH_UNIX),
        }
    }

    /// Current latch position.
    pub fn platch(&self) -> u8 {
        self.platch.load(Ordering::Acquire)
    }

    /// The window at a latch position.
    pub fn window(&self, platch: u8) -> Option<&SyscallWin> {
        self.slots.get(platch as usize)
    }

    /// Inherit a latch position without validation (process creation).
    pub fn set_platch_raw(&self, platch: u8) {
        self.platch.store(platch, Ordering::Release);
    }

    /// Slide the latch. Valid targets are exactly the populated windows.
    pub fn slide(&self, platch: u8) -> KernelResult<()> {
        match self.window(platch) {
            Some(win) if win.present => {
                self.platch.store(platch, Ordering::Release);
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl Default for SyscallDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// Slide the platform latch of the calling process.
///
/// ARG0: target window index.
pub fn sys_scslide(args: &mut SyscallArgs) -> isize {
    let target = args.arg(0);
    if target > u8::MAX as u64 {
        return Errno::Inval.as_ret();
    }
    let Some(proc) = crate::process::current() else {
        return Errno::Srch.as_ret();
    };
    match proc.scdom.slide(target as u8) {
        Ok(()) => 0,
        Err(e) => Errno::from(e).as_ret(),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn latch_round_trip() {
        let dom = SyscallDomain::new();
        assert_eq!(dom.platch(), PLATCH_UNIX);

        dom.slide(PLATCH_NATIVE).expect("native window is populated");
        assert_eq!(dom.platch(), PLATCH_NATIVE);

        dom.slide(PLATCH_UNIX).expect("back to unix");
        assert_eq!(dom.platch(), PLATCH_UNIX);
    }

    #[test]
    fn slide_rejects_unpopulated_positions() {
        let dom = SyscallDomain::new();
        assert_eq!(dom.slide(5), Err(KernelError::InvalidArgument));
        assert_eq!(dom.platch(), PLATCH_UNIX, "failed slide leaves the latch");
    }

    #[test]
    fn slide_call_is_reachable_from_every_window() {
        // The latch-slide call must sit at the same index in every
        // installed table, or a process could strand itself.
        let dom = SyscallDomain::new();
        for platch in [PLATCH_UNIX, PLATCH_NATIVE] {
            let win = dom.window(platch).expect("window exists");
            assert!(win.present);
            assert!(
                win.table[SYS_SCSLIDE].is_some(),
                "window {} lacks the slide call",
                platch
            );
        }
    }
}
