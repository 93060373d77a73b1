//! File descriptors
//!
//! Per-process descriptor table over VFS vnodes: open/read/write/close,
//! seeking, duplication, and the standard-stream setup used at spawn.
//! Descriptor entries own an offset and mode; the vnode behind them is a
//! shared reference.

use alloc::sync::Arc;

use bitflags::bitflags;

use super::namei::{namei, NameiFlags};
use super::{Vnode, VnodeType};
use crate::error::{KernelError, KernelResult};
use crate::process::{Process, FD_MAX};

bitflags! {
    /// Descriptor access mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
    }
}

/// Seek anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: u64) -> Option<Whence> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// One open file.
#[derive(Clone)]
pub struct FileDesc {
    pub fdno: i32,
    pub vp: Arc<Vnode>,
    pub mode: OpenMode,
    pub off: usize,
}

/// Install a vnode in the lowest free descriptor slot.
pub fn fdtab_install(proc: &Arc<Process>, vp: Arc<Vnode>, mode: OpenMode) -> KernelResult<i32> {
    let mut fdtab = proc.fdtab.lock();
    for (i, slot) in fdtab.iter_mut().enumerate() {
        if slot.is_none() {
            let fd = i as i32;
            *slot = Some(FileDesc {
                fdno: fd,
                vp,
                mode,
                off: 0,
            });
            return Ok(fd);
        }
    }
    Err(KernelError::TooManyFiles)
}

/// Fetch a descriptor by number.
pub fn fd_get(proc: &Arc<Process>, fd: i32) -> KernelResult<FileDesc> {
    if fd < 0 || fd as usize >= FD_MAX {
        return Err(KernelError::BadFd);
    }
    proc.fdtab.lock()[fd as usize]
        .clone()
        .ok_or(KernelError::BadFd)
}

/// Duplicate a descriptor: the copy shares the vnode and mode but owns
/// its slot. The source descriptor is validated before anything is
/// allocated.
pub fn fd_dup(proc: &Arc<Process>, fd: i32) -> KernelResult<i32> {
    let old = fd_get(proc, fd)?;
    fdtab_install(proc, old.vp.clone(), old.mode)
}

/// Open `path` into the lowest free descriptor.
pub fn fd_open(proc: &Arc<Process>, path: &str, mode: OpenMode) -> KernelResult<i32> {
    let flags = if mode.contains(OpenMode::CREATE) {
        NameiFlags::CREATE
    } else {
        NameiFlags::empty()
    };
    let vp = namei(path, flags)?;
    fdtab_install(proc, vp, mode)
}

/// Close a descriptor, releasing its vnode reference.
pub fn fd_close(proc: &Arc<Process>, fd: i32) -> KernelResult<()> {
    if fd < 0 || fd as usize >= FD_MAX {
        return Err(KernelError::BadFd);
    }
    let mut fdtab = proc.fdtab.lock();
    if fdtab[fd as usize].take().is_none() {
        return Err(KernelError::BadFd);
    }
    Ok(())
}

/// Write through a descriptor at its current offset.
pub fn fd_write(proc: &Arc<Process>, fd: i32, buf: &[u8]) -> KernelResult<usize> {
    if fd < 0 || fd as usize >= FD_MAX {
        return Err(KernelError::BadFd);
    }
    let mut fdtab = proc.fdtab.lock();
    let desc = fdtab[fd as usize].as_mut().ok_or(KernelError::BadFd)?;

    if !desc.mode.contains(OpenMode::WRITE) {
        return Err(KernelError::PermissionDenied);
    }
    let n = desc.vp.write(buf, desc.off)?;
    if desc.vp.vtype() != VnodeType::CharDev {
        desc.off += n;
    }
    Ok(n)
}

/// Read through a descriptor at its current offset.
pub fn fd_read(proc: &Arc<Process>, fd: i32, buf: &mut [u8]) -> KernelResult<usize> {
    if fd < 0 || fd as usize >= FD_MAX {
        return Err(KernelError::BadFd);
    }
    let mut fdtab = proc.fdtab.lock();
    let desc = fdtab[fd as usize].as_mut().ok_or(KernelError::BadFd)?;

    if !desc.mode.contains(OpenMode::READ) {
        return Err(KernelError::PermissionDenied);
    }
    let n = desc.vp.read(buf, desc.off)?;
    if desc.vp.vtype() != VnodeType::CharDev {
        desc.off += n;
    }
    Ok(n)
}

/// Reposition a descriptor's offset.
pub fn fd_lseek(proc: &Arc<Process>, fd: i32, off: i64, whence: Whence) -> KernelResult<usize> {
    if fd < 0 || fd as usize >= FD_MAX {
        return Err(KernelError::BadFd);
    }
    let mut fdtab = proc.fdtab.lock();
    let desc = fdtab[fd as usize].as_mut().ok_or(KernelError::BadFd)?;

    let base = match whence {
        Whence::Set => 0i64,
        Whence::Cur => desc.off as i64,
        Whence::End => desc.vp.getattr()?.size as i64,
    };
    let new = base.checked_add(off).ok_or(KernelError::InvalidArgument)?;
    if new < 0 {
        return Err(KernelError::InvalidArgument);
    }
    desc.off = new as usize;
    Ok(desc.off)
}

/// Wire the three standard streams of a fresh process to the console.
pub fn fdtab_init(proc: &Arc<Process>) -> KernelResult<()> {
    for _ in 0..3 {
        let vp = super::devfs::console_vnode();
        fdtab_install(proc, vp, OpenMode::READ | OpenMode::WRITE)?;
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::Process;

    #[test]
    fn std_streams_land_on_fds_0_through_2() {
        let proc = Process::for_tests(300);
        fdtab_init(&proc).expect("standard stream setup");

        for fd in 0..3 {
            let desc = fd_get(&proc, fd).expect("std fd present");
            assert_eq!(desc.vp.vtype(), VnodeType::CharDev);
        }
        assert!(fd_get(&proc, 3).is_err());
    }

    #[test]
    fn write_to_read_only_fd_is_permission_denied() {
        let proc = Process::for_tests(301);
        let vp = crate::fs::devfs::console_vnode();
        let fd = fdtab_install(&proc, vp, OpenMode::READ).expect("install");

        assert_eq!(
            fd_write(&proc, fd, b"nope").err(),
            Some(KernelError::PermissionDenied)
        );
    }

    #[test]
    fn write_to_console_fd_returns_length() {
        let proc = Process::for_tests(302);
        fdtab_init(&proc).expect("std streams");

        let _guard = crate::console::CONSOLE_TEST_LOCK.lock();
        let n = fd_write(&proc, 1, b"hello").expect("console write");
        assert_eq!(n, 5, "write returns the byte count");

        let mut tail = [0u8; 5];
        crate::console::read_tail(&mut tail);
        assert_eq!(&tail, b"hello", "bytes reach the console buffer in order");
    }

    #[test]
    fn dup_validates_source_and_shares_the_vnode() {
        let proc = Process::for_tests(303);
        assert_eq!(
            fd_dup(&proc, 7).err(),
            Some(KernelError::BadFd),
            "duplicating a closed descriptor fails before allocation"
        );

        fdtab_init(&proc).expect("std streams");
        let dup = fd_dup(&proc, 1).expect("dup of open fd");
        assert_eq!(dup, 3, "lowest free slot");

        let a = fd_get(&proc, 1).unwrap();
        let b = fd_get(&proc, dup).unwrap();
        assert!(Arc::ptr_eq(&a.vp, &b.vp), "dup shares the vnode");
    }

    #[test]
    fn close_releases_the_slot() {
        let proc = Process::for_tests(304);
        fdtab_init(&proc).expect("std streams");

        fd_close(&proc, 2).expect("close");
        assert_eq!(fd_get(&proc, 2).err(), Some(KernelError::BadFd));
        assert_eq!(fd_close(&proc, 2).err(), Some(KernelError::BadFd));
    }

    #[test]
    fn lseek_anchors() {
        let proc = Process::for_tests(305);

        // Seek over a tmpfs file with known size.
        let _guard = crate::fs::mount::VFS_TEST_LOCK.lock();
        crate::fs::mount::clear_mounts();
        crate::fs::mount::kmount("tmpfs", "/seektest").expect("mount");
        let vp = crate::fs::namei::namei("/seektest/file", crate::fs::namei::NameiFlags::CREATE)
            .expect("create file");
        vp.write(b"0123456789", 0).expect("seed data");

        let fd = fdtab_install(&proc, vp, OpenMode::READ | OpenMode::WRITE).expect("install");
        assert_eq!(fd_lseek(&proc, fd, 4, Whence::Set).unwrap(), 4);
        assert_eq!(fd_lseek(&proc, fd, 2, Whence::Cur).unwrap(), 6);
        assert_eq!(fd_lseek(&proc, fd, 0, Whence::End).unwrap(), 10);
        assert!(fd_lseek(&proc, fd, -20, Whence::Cur).is_err());
        crate::fs::mount::clear_mounts();
    }
}
