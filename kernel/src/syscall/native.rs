//! Native syscall window
//!
//! The kernel-native ABI presentation. Deliberately narrow: the calls
//! every window must carry between latch positions (exit, cross-border,
//! query-border) plus the latch slide itself at the shared index. The
//! rest of the surface is UNIX-window territory.

use super::domain::sys_scslide;
use super::{Sccb, SyscallArgs};
use crate::error::Errno;

/// Exit under the native ABI: same semantics, native number space.
fn sys_native_exit(args: &mut SyscallArgs) -> isize {
    let status = args.arg(0) as i32;
    if let Some(proc) = crate::process::current() {
        let _ = crate::process::proc_kill(&proc, status);
    }
    Errno::Srch.as_ret()
}

static NATIVE_SCTAB: [Option<Sccb>; 18] = [
    None,                                   // 0
    Some(sys_native_exit),                  // 1
    None,                                   // 2
    Some(crate::security::mac::sys_cross),  // 3 (mandatory between latches)
    None,                                   // 4
    Some(crate::security::mac::sys_query),  // 5 (mandatory between latches)
    None,                                   // 6
    None,                                   // 7
    None,                                   // 8
    None,                                   // 9
    None,                                   // 10
    None,                                   // 11
    None,                                   // 12
    None,                                   // 13
    None,                                   // 14
    None,                                   // 15
    None,                                   // 16
    Some(sys_scslide),                      // 17
];

/// The native table.
pub fn table() -> &'static [Option<Sccb>] {
    &NATIVE_SCTAB
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn mandatory_calls_share_indices_with_the_unix_window() {
        use crate::syscall::domain::SYS_SCSLIDE;
        use crate::syscall::unix::{self, SYS_CROSS, SYS_QUERY};

        let native_tab = table();
        let unix_tab = unix::table();

        // cross, query and the slide sit at identical indices so a
        // process can reach them from either presentation.
        for idx in [SYS_CROSS, SYS_QUERY, SYS_SCSLIDE] {
            assert!(native_tab[idx].is_some());
            assert!(unix_tab[idx].is_some());
        }
    }
}
