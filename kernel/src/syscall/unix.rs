//! UNIX-like syscall window
//!
//! The default ABI surface. Numbers: 1 exit, 2 write, 3 cross-border,
//! 4 sigaction, 5 query-border, 6 spawn, 7 mount, 8 open, 9 mux-iotap,
//! 10 get-argv, 11 reboot, 12 waitpid, 13 dms-io, 14 read, 15 close,
//! 16 lseek, 17 latch-slide.

use alloc::string::String;
use alloc::vec::Vec;

use super::domain::sys_scslide;
use super::{Sccb, SyscallArgs};
use crate::error::Errno;
use crate::fs::file::{self, OpenMode, Whence};
use crate::mm::user_validation::{copyin, copyin_value, copyinstr, copyout};
use crate::process;

pub const SYS_EXIT: usize = 0x01;
pub const SYS_WRITE: usize = 0x02;
pub const SYS_CROSS: usize = 0x03;
pub const SYS_SIGACTION: usize = 0x04;
pub const SYS_QUERY: usize = 0x05;
pub const SYS_SPAWN: usize = 0x06;
pub const SYS_MOUNT: usize = 0x07;
pub const SYS_OPEN: usize = 0x08;
pub const SYS_MUXTAP: usize = 0x09;
pub const SYS_GETARGV: usize = 0x0A;
pub const SYS_REBOOT: usize = 0x0B;
pub const SYS_WAITPID: usize = 0x0C;
pub const SYS_DMSIO: usize = 0x0D;
pub const SYS_READ: usize = 0x0E;
pub const SYS_CLOSE: usize = 0x0F;
pub const SYS_LSEEK: usize = 0x10;

/// Ceiling on a single read/write bounce.
const IO_BOUNCE_MAX: usize = 64 * 1024;

/// Most argv entries spawn will carry across.
const ARGV_MAX: usize = 16;

static UNIX_SCTAB: [Option<Sccb>; 18] = [
    None,                              // 0
    Some(sys_exit),                    // 1
    Some(sys_write),                   // 2
    Some(crate::security::mac::sys_cross), // 3
    Some(crate::signal::sys_sigaction),    // 4
    Some(crate::security::mac::sys_query), // 5
    Some(sys_spawn),                   // 6
    Some(sys_mount),                   // 7
    Some(sys_open),                    // 8
    Some(crate::iotap::sys_muxtap),    // 9
    Some(sys_getargv),                 // 10
    Some(sys_reboot),                  // 11
    Some(sys_waitpid),                 // 12
    Some(crate::dms::sys_dmsio),       // 13
    Some(sys_read),                    // 14
    Some(sys_close),                   // 15
    Some(sys_lseek),                   // 16
    Some(sys_scslide),                 // 17
];

/// The UNIX-like table.
pub fn table() -> &'static [Option<Sccb>] {
    &UNIX_SCTAB
}

fn path_arg(uaddr: u64) -> Result<String, Errno> {
    let mut buf = [0u8; crate::fs::PATH_MAX];
    let len = copyinstr(uaddr, &mut buf).map_err(Errno::from)?;
    core::str::from_utf8(&buf[..len])
        .map(String::from)
        .map_err(|_| Errno::Inval)
}

/// Exit the current process. Does not return on the target.
fn sys_exit(args: &mut SyscallArgs) -> isize {
    let status = args.arg(0) as i32;
    if let Some(proc) = process::current() {
        let _ = process::proc_kill(&proc, status);
    }
    // Only reachable when there was no process to kill.
    Errno::Srch.as_ret()
}

/// Write to a file descriptor. ARG0: fd, ARG1: buffer, ARG2: length.
fn sys_write(args: &mut SyscallArgs) -> isize {
    let fd = args.arg(0) as i32;
    let u_buf = args.arg(1);
    let len = (args.arg(2) as usize).min(IO_BOUNCE_MAX);

    let Some(proc) = process::current() else {
        return Errno::Srch.as_ret();
    };

    let mut bounce = alloc::vec![0u8; len];
    if let Err(e) = copyin(u_buf, &mut bounce) {
        return Errno::from(e).as_ret();
    }
    match file::fd_write(&proc, fd, &bounce) {
        Ok(n) => n as isize,
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Read from a file descriptor. ARG0: fd, ARG1: buffer, ARG2: length.
fn sys_read(args: &mut SyscallArgs) -> isize {
    let fd = args.arg(0) as i32;
    let u_buf = args.arg(1);
    let len = (args.arg(2) as usize).min(IO_BOUNCE_MAX);

    let Some(proc) = process::current() else {
        return Errno::Srch.as_ret();
    };

    let mut bounce = alloc::vec![0u8; len];
    match file::fd_read(&proc, fd, &mut bounce) {
        Ok(n) => {
            if n > 0 {
                if let Err(e) = copyout(&bounce[..n], u_buf) {
                    return Errno::from(e).as_ret();
                }
            }
            n as isize
        }
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Spawn a process from a binary. ARG0: path, ARG1: argv (may be null).
fn sys_spawn(args: &mut SyscallArgs) -> isize {
    let path = match path_arg(args.arg(0)) {
        Ok(p) => p,
        Err(e) => return e.as_ret(),
    };

    let mut argv: Vec<String> = Vec::new();
    let u_argv = args.arg(1);
    if u_argv != 0 {
        for i in 0..ARGV_MAX {
            let u_ptr = match copyin_value::<u64>(u_argv + (i * 8) as u64) {
                Ok(p) => p,
                Err(e) => return Errno::from(e).as_ret(),
            };
            if u_ptr == 0 {
                break;
            }
            match path_arg(u_ptr) {
                Ok(s) => argv.push(s),
                Err(e) => return e.as_ret(),
            }
        }
    }

    match process::spawn(&path, &argv) {
        Ok(pid) => pid as isize,
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Mount a filesystem. ARG0: fstype, ARG1: target.
fn sys_mount(args: &mut SyscallArgs) -> isize {
    let fstype = match path_arg(args.arg(0)) {
        Ok(p) => p,
        Err(e) => return e.as_ret(),
    };
    let target = match path_arg(args.arg(1)) {
        Ok(p) => p,
        Err(e) => return e.as_ret(),
    };

    match crate::fs::mount::kmount(fstype.trim_start_matches('/'), &target) {
        Ok(()) => 0,
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Open a file. ARG0: path, ARG1: mode bits.
fn sys_open(args: &mut SyscallArgs) -> isize {
    let path = match path_arg(args.arg(0)) {
        Ok(p) => p,
        Err(e) => return e.as_ret(),
    };
    let Some(mode) = OpenMode::from_bits(args.arg(1) as u32) else {
        return Errno::Inval.as_ret();
    };

    let Some(proc) = process::current() else {
        return Errno::Srch.as_ret();
    };
    match file::fd_open(&proc, &path, mode) {
        Ok(fd) => fd as isize,
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Fetch an argument pointer from the environment block. ARG0: index.
/// Returns the user VA of the requested argument string.
fn sys_getargv(args: &mut SyscallArgs) -> isize {
    let index = args.arg(0) as usize;
    let Some(proc) = process::current() else {
        return Errno::Srch.as_ret();
    };

    let envblk = proc.envblk.lock();
    let Some(env) = envblk.as_ref() else {
        return Errno::Inval.as_ret();
    };
    match env.argv.get(index) {
        Some(va) => *va as isize,
        None => Errno::Inval.as_ret(),
    }
}

/// Reboot the machine.
#[cfg(target_os = "none")]
fn sys_reboot(_args: &mut SyscallArgs) -> isize {
    log::warn!("reboot requested");
    crate::arch::x86_64::reboot::cpu_reset()
}

/// Reboot the machine (host stub).
#[cfg(not(target_os = "none"))]
fn sys_reboot(_args: &mut SyscallArgs) -> isize {
    log::warn!("reboot requested");
    Errno::NotSup.as_ret()
}

/// Wait for a child to exit. ARG0: child pid. Returns the exit status;
/// parks the caller (and does not return here) while the child runs.
fn sys_waitpid(args: &mut SyscallArgs) -> isize {
    let pid = args.arg(0);
    let Some(proc) = process::current() else {
        return Errno::Srch.as_ret();
    };
    match process::exit::waitpid(&proc, pid, args.tf) {
        Ok(status) => status as isize,
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Close a file descriptor. ARG0: fd.
fn sys_close(args: &mut SyscallArgs) -> isize {
    let fd = args.arg(0) as i32;
    let Some(proc) = process::current() else {
        return Errno::Srch.as_ret();
    };
    match file::fd_close(&proc, fd) {
        Ok(()) => 0,
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Reposition a file offset. ARG0: fd, ARG1: offset, ARG2: whence.
fn sys_lseek(args: &mut SyscallArgs) -> isize {
    let fd = args.arg(0) as i32;
    let off = args.arg(1) as i64;
    let Some(whence) = Whence::from_raw(args.arg(2)) else {
        return Errno::Inval.as_ret();
    };

    let Some(proc) = process::current() else {
        return Errno::Srch.as_ret();
    };
    match file::fd_lseek(&proc, fd, off, whence) {
        Ok(pos) => pos as isize,
        Err(e) => Errno::from(e).as_ret(),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn table_layout_matches_the_abi_numbers() {
        let tab = table();
        assert_eq!(tab.len(), 18);
        assert!(tab[0].is_none(), "call number zero is never dispatched");
        for n in [
            SYS_EXIT,
            SYS_WRITE,
            SYS_CROSS,
            SYS_SIGACTION,
            SYS_QUERY,
            SYS_SPAWN,
            SYS_MOUNT,
            SYS_OPEN,
            SYS_MUXTAP,
            SYS_GETARGV,
            SYS_REBOOT,
            SYS_WAITPID,
            SYS_DMSIO,
            SYS_READ,
            SYS_CLOSE,
            SYS_LSEEK,
        ] {
            assert!(tab[n].is_some(), "syscall {} must be implemented", n);
        }
    }
}
