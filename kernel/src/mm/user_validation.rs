//! User pointer validation and safe copies
//!
//! Every syscall that dereferences a user pointer goes through
//! `check_addr` first: the span must sit inside the user half and inside
//! one of the caller's recorded ranges. Kernel copies then use
//! `copyin`/`copyout`/`copyinstr`, which validate and memcpy.

use alloc::sync::Arc;

use super::USER_SPACE_END;
use crate::error::{KernelError, KernelResult};
use crate::process::Process;

/// Verify that `[addr, addr + len)` lies inside the user half of the
/// address space and inside some recorded range of `proc`.
pub fn check_addr(proc: &Arc<Process>, addr: u64, len: usize) -> KernelResult<()> {
    if addr == 0 || len == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let end = addr
        .checked_add(len as u64)
        .ok_or(KernelError::BadAddress { addr })?;
    if end > USER_SPACE_END {
        return Err(KernelError::BadAddress { addr });
    }

    if proc.range_covering(addr, len as u64).is_some() {
        Ok(())
    } else {
        Err(KernelError::BadAddress { addr })
    }
}

fn current_proc() -> KernelResult<Arc<Process>> {
    crate::process::current().ok_or(KernelError::Io)
}

/// Copy `len` bytes from user space into a kernel buffer.
pub fn copyin(uaddr: u64, kbuf: &mut [u8]) -> KernelResult<()> {
    let len = kbuf.len();
    let proc = current_proc()?;
    check_addr(&proc, uaddr, len)?;

    // SAFETY: the span was validated against the caller's range list and
    // the user half; the process address space is active.
    unsafe {
        core::ptr::copy_nonoverlapping(uaddr as *const u8, kbuf.as_mut_ptr(), len);
    }
    Ok(())
}

/// Copy `kbuf` out to user space at `uaddr`.
pub fn copyout(kbuf: &[u8], uaddr: u64) -> KernelResult<()> {
    let len = kbuf.len();
    let proc = current_proc()?;
    check_addr(&proc, uaddr, len)?;

    // SAFETY: as in `copyin`.
    unsafe {
        core::ptr::copy_nonoverlapping(kbuf.as_ptr(), uaddr as *mut u8, len);
    }
    Ok(())
}

/// Copy a NUL-terminated string from user space into `kbuf`, returning its
/// length (NUL excluded). The whole destination window must be valid user
/// memory; overlong strings fail with name-too-long.
pub fn copyinstr(uaddr: u64, kbuf: &mut [u8]) -> KernelResult<usize> {
    let proc = current_proc()?;
    check_addr(&proc, uaddr, kbuf.len())?;

    for (i, slot) in kbuf.iter_mut().enumerate() {
        // SAFETY: offset i is inside the validated window.
        let byte = unsafe { core::ptr::read((uaddr + i as u64) as *const u8) };
        *slot = byte;
        if byte == 0 {
            return Ok(i);
        }
    }
    Err(KernelError::NameTooLong)
}

/// Copy a typed value out to user space.
pub fn copyout_value<T: Copy>(val: &T, uaddr: u64) -> KernelResult<()> {
    // SAFETY: `val` is a live reference; viewing it as bytes is sound for
    // Copy types handed across the ABI.
    let bytes = unsafe {
        core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
    };
    copyout(bytes, uaddr)
}

/// Copy a typed value in from user space.
pub fn copyin_value<T: Copy + Default>(uaddr: u64) -> KernelResult<T> {
    let mut val = T::default();
    // SAFETY: `val` is a live exclusive reference; writing its bytes from
    // a validated user span is sound for Copy types.
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(&mut val as *mut T as *mut u8, core::mem::size_of::<T>())
    };
    copyin(uaddr, bytes)?;
    Ok(val)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::Process;

    #[test]
    fn check_addr_accepts_spans_inside_one_range() {
        let proc = Process::for_tests(400);
        proc.add_range(0x40_0000, 0x90_0000, 0x3000);

        assert!(check_addr(&proc, 0x40_0000, 0x3000).is_ok());
        assert!(check_addr(&proc, 0x40_1000, 0x100).is_ok());
    }

    #[test]
    fn check_addr_rejects_unmapped_null_and_kernel_spans() {
        let proc = Process::for_tests(401);
        proc.add_range(0x40_0000, 0x90_0000, 0x1000);

        assert!(check_addr(&proc, 0, 8).is_err(), "null pointer");
        assert!(check_addr(&proc, 0xdead_b000, 8).is_err(), "outside every range");
        assert!(
            check_addr(&proc, 0x40_0000, 0x2000).is_err(),
            "span leaking past the record"
        );
        assert!(
            check_addr(&proc, 0xFFFF_8000_0000_0000, 8).is_err(),
            "kernel half is never user-dereferencable"
        );
        assert!(check_addr(&proc, u64::MAX - 4, 16).is_err(), "wrapping span");
    }
}
