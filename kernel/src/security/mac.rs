//! Mandatory access control borders
//!
//! A border sits between a privileged resource and user space: it carries
//! an access level and an operation vector, and is the sole gateway by
//! which processes obtain mappings of the resource or query its
//! attributes. A process may cross a border iff its own level is at least
//! the border's.

use alloc::sync::Arc;

use crate::error::{Errno, KernelError, KernelResult};
use crate::mm::user_validation::{check_addr, copyout};
use crate::process::Process;
use crate::syscall::SyscallArgs;

/// MAC levels. Lower levels cannot touch higher-level borders; higher
/// levels can touch lower ones.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MacLevel {
    #[default]
    Global = 0,
    Restricted = 1,
    Secret = 2,
}

/// Stable border identifiers; indexes the border table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderId {
    None = 0,
    Fbdev = 1,
}

impl BorderId {
    pub fn from_raw(raw: u64) -> Option<BorderId> {
        match raw {
            0 => Some(BorderId::None),
            1 => Some(BorderId::Fbdev),
            _ => None,
        }
    }
}

/// Map request handed to a border's map hook.
#[derive(Debug, Clone, Copy)]
pub struct MacMapArgs {
    pub off: i64,
    pub len: usize,
    pub flags: u32,
}

/// Border operation hooks. Implemented per resource; third-party borders
/// plug in through this interface.
pub trait MacOps: Send + Sync {
    /// Map the resource into the calling process's address space.
    /// Returns the user-visible address and the (possibly truncated)
    /// mapped length.
    fn map(&self, border: &MacBorder, args: &mut MacMapArgs) -> KernelResult<(u64, usize)>;

    /// Copy resource attributes into `buf`, returning the byte count.
    fn getattr(&self, border: &MacBorder, buf: &mut [u8]) -> KernelResult<usize>;
}

/// A resource border: required level plus operations.
pub struct MacBorder {
    pub level: MacLevel,
    pub ops: &'static dyn MacOps,
}

/// The border table, indexed by `BorderId`.
static BORTAB: [Option<&'static MacBorder>; 2] = [None, Some(&FBDEV_BORDER)];

/// Fetch a border by id.
pub fn get_border(id: BorderId) -> Option<&'static MacBorder> {
    BORTAB.get(id as usize).copied().flatten()
}

/// Gate: may `proc` access a resource at `level`?
pub fn check_level(proc: &Arc<Process>, level: MacLevel) -> KernelResult<()> {
    if proc.level() < level {
        return Err(KernelError::PermissionDenied);
    }
    Ok(())
}

/// The canonical way user code obtains a mapping of a bordered resource:
/// level check, then the border's own map hook (which does the backing
/// allocation and calls into the mapper).
pub fn mac_map(
    border: &'static MacBorder,
    off: i64,
    len: usize,
    flags: u32,
) -> KernelResult<(u64, usize)> {
    let proc = crate::process::current().ok_or(KernelError::NoProcess)?;
    check_level(&proc, border.level)?;

    let mut args = MacMapArgs { off, len, flags };
    border.ops.map(border, &mut args)
}

// ---------------------------------------------------------------------------
// Framebuffer border
// ---------------------------------------------------------------------------

/// Attributes reported by the framebuffer border.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FbAttr {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
}

struct FbdevOps;

/// Map up to `width * pitch` bytes of video RAM into the caller's address
/// space as READ|WRITE|USER, truncating the length to the device maximum.
#[cfg(target_os = "none")]
fn fbdev_do_map(args: &mut MacMapArgs) -> KernelResult<(u64, usize)> {
    use crate::mm::{MapSpec, Protection};

    let bv = crate::bootvars::read();
    let fb = bv.fb.ok_or(KernelError::NoDevice)?;

    // Truncate to the device maximum.
    let max = fb.max_map_len();
    if args.len > max {
        args.len = max;
    }
    if args.len == 0 {
        return Err(KernelError::InvalidArgument);
    }

    // The framebuffer is mapped in the kernel half; resolve its physical
    // base through the active tables, then hand user space an identity
    // mapping of the aperture.
    let vas = crate::mm::Vas::current();
    let fb_pa =
        crate::mm::page_table::translate(vas.root(), fb.base).ok_or(KernelError::Io)?;

    let mut spec = MapSpec::new(fb_pa, fb_pa);
    crate::mm::vas::vm_map(
        &vas,
        &mut spec,
        args.len,
        Protection::READ | Protection::WRITE | Protection::USER,
    )?;
    Ok((spec.virt, args.len))
}

#[cfg(not(target_os = "none"))]
fn fbdev_do_map(_args: &mut MacMapArgs) -> KernelResult<(u64, usize)> {
    Err(KernelError::NotSupported)
}

impl MacOps for FbdevOps {
    fn map(&self, _border: &MacBorder, args: &mut MacMapArgs) -> KernelResult<(u64, usize)> {
        fbdev_do_map(args)
    }

    fn getattr(&self, _border: &MacBorder, buf: &mut [u8]) -> KernelResult<usize> {
        let bv = crate::bootvars::read();
        let fb = bv.fb.ok_or(KernelError::NoDevice)?;
        let attr = FbAttr {
            width: fb.width,
            height: fb.height,
            pitch: fb.pitch,
            bpp: fb.bpp,
        };

        let len = core::mem::size_of::<FbAttr>().min(buf.len());
        // SAFETY: FbAttr is plain old data; we copy at most its size.
        let bytes = unsafe {
            core::slice::from_raw_parts(&attr as *const FbAttr as *const u8, len)
        };
        buf[..len].copy_from_slice(bytes);
        Ok(len)
    }
}

static FBDEV_OPS: FbdevOps = FbdevOps;

/// The framebuffer border: mappable video RAM at RESTRICTED.
pub static FBDEV_BORDER: MacBorder = MacBorder {
    level: MacLevel::Restricted,
    ops: &FBDEV_OPS,
};

// ---------------------------------------------------------------------------
// Syscalls
// ---------------------------------------------------------------------------

/// Cross a resource border.
///
/// ARG0: border id, ARG1: length, ARG2: offset, ARG3: flags,
/// ARG4: result pointer (the mapped address is written here).
pub fn sys_cross(args: &mut SyscallArgs) -> isize {
    let Some(id) = BorderId::from_raw(args.arg(0)) else {
        return Errno::Inval.as_ret();
    };
    let len = args.arg(1) as usize;
    let off = args.arg(2) as i64;
    let flags = args.arg(3) as u32;
    let u_res = args.arg(4);

    let Some(proc) = crate::process::current() else {
        return Errno::Srch.as_ret();
    };
    if let Err(e) = check_addr(&proc, u_res, core::mem::size_of::<u64>()) {
        return Errno::from(e).as_ret();
    }

    let Some(border) = get_border(id) else {
        return Errno::Io.as_ret();
    };

    match mac_map(border, off, len, flags) {
        Ok((addr, mapped)) => {
            if let Err(e) = copyout(&addr.to_ne_bytes(), u_res) {
                return Errno::from(e).as_ret();
            }
            mapped as isize
        }
        Err(e) => Errno::from(e).as_ret(),
    }
}

/// Query a border's attributes.
///
/// ARG0: border id, ARG1: data pointer, ARG2: data length, ARG3: flags.
pub fn sys_query(args: &mut SyscallArgs) -> isize {
    let Some(id) = BorderId::from_raw(args.arg(0)) else {
        return Errno::Inval.as_ret();
    };
    let u_data = args.arg(1);
    let u_len = args.arg(2) as usize;

    let Some(border) = get_border(id) else {
        return Errno::Io.as_ret();
    };

    // Can we even touch this?
    let Some(proc) = crate::process::current() else {
        return Errno::Srch.as_ret();
    };
    if let Err(e) = check_level(&proc, border.level) {
        return Errno::from(e).as_ret();
    }
    if let Err(e) = check_addr(&proc, u_data, u_len) {
        return Errno::from(e).as_ret();
    }

    let mut bounce = alloc::vec![0u8; u_len.min(4096)];
    match border.ops.getattr(border, &mut bounce) {
        Ok(n) => {
            if let Err(e) = copyout(&bounce[..n], u_data) {
                return Errno::from(e).as_ret();
            }
            n as isize
        }
        Err(e) => Errno::from(e).as_ret(),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::Process;

    #[test]
    fn levels_are_ordered() {
        assert!(MacLevel::Global < MacLevel::Restricted);
        assert!(MacLevel::Restricted < MacLevel::Secret);
    }

    #[test]
    fn border_access_requires_dominating_level() {
        // Processes start at GLOBAL; the framebuffer border wants
        // RESTRICTED, so the check must refuse.
        let proc = Process::for_tests(500);
        let border = get_border(BorderId::Fbdev).expect("fbdev border installed");
        assert_eq!(border.level, MacLevel::Restricted);
        assert_eq!(
            check_level(&proc, border.level),
            Err(KernelError::PermissionDenied)
        );

        // A level dominates itself and everything below.
        assert!(check_level(&proc, MacLevel::Global).is_ok());
    }

    #[test]
    fn unknown_border_ids_resolve_to_nothing() {
        assert!(get_border(BorderId::None).is_none());
        assert!(BorderId::from_raw(99).is_none());
    }
}
