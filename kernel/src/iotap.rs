//! I/O-tap namespace
//!
//! Named byte-oriented device endpoints multiplexed through one kernel
//! entry point. Registration deep-copies the descriptor into the kernel
//! namespace and assigns a monotonically increasing id; descriptors are
//! immutable afterwards, so lookup returns by value. Taps are never
//! reclaimed in this design.

use alloc::string::{String, ToString};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{Errno, KernelError, KernelResult};
use crate::mm::user_validation::{copyin_value, copyinstr, copyout};
use crate::ns::NsMap;
use crate::syscall::SyscallArgs;

/// Ceiling on a single mux transfer.
pub const IOTAP_MSG_MAX: usize = 4096;

/// Longest tap name, terminator included.
pub const IOTAP_NAME_MAX: usize = 64;

/// Mux operation codes.
pub const IOTAP_OPC_READ: u32 = 0;

/// Tap operation hooks.
pub trait IotapOps: Send + Sync {
    /// Read from the endpoint into `buf`, returning the byte count.
    fn read(&self, desc: &IotapDesc, buf: &mut [u8]) -> KernelResult<usize>;
}

/// A named endpoint descriptor.
#[derive(Clone)]
pub struct IotapDesc {
    pub name: String,
    pub id: u64,
    pub ops: &'static dyn IotapOps,
}

/// User-side mux message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IotapMsg {
    pub opcode: u32,
    pub buf: u64,
    pub len: usize,
}

static NAMESPACE: Mutex<NsMap<IotapDesc>> = Mutex::new(NsMap::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Register an endpoint. The descriptor is copied into the namespace; the
/// assigned id comes back.
pub fn register(name: &str, ops: &'static dyn IotapOps) -> KernelResult<u64> {
    if name.is_empty() || name.len() >= IOTAP_NAME_MAX {
        return Err(KernelError::InvalidArgument);
    }

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let desc = IotapDesc {
        name: name.to_string(),
        id,
        ops,
    };
    NAMESPACE.lock().enter(name, desc)?;
    Ok(id)
}

/// Look an endpoint up by name. Safe to return by value: descriptors are
/// immutable after registration.
pub fn lookup(name: &str) -> KernelResult<IotapDesc> {
    NAMESPACE
        .lock()
        .lookup(name)
        .cloned()
        .ok_or(KernelError::NotFound)
}

/// Dispatch one message to the named endpoint.
pub fn mux(name: &str, opcode: u32, buf: &mut [u8]) -> KernelResult<usize> {
    if buf.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let desc = lookup(name)?;

    match opcode {
        IOTAP_OPC_READ => desc.ops.read(&desc, buf),
        _ => Err(KernelError::InvalidArgument),
    }
}

/// Mux an I/O tap.
///
/// ARG0: tap name, ARG1: message pointer. The transfer bounces through a
/// kernel buffer capped at `IOTAP_MSG_MAX`; on success the data and the
/// byte count are copied back out.
pub fn sys_muxtap(args: &mut SyscallArgs) -> isize {
    let u_name = args.arg(0);
    let u_msg = args.arg(1);

    let mut namebuf = [0u8; IOTAP_NAME_MAX];
    let name_len = match copyinstr(u_name, &mut namebuf) {
        Ok(n) => n,
        Err(e) => {
            log::warn!("muxtap: bad address for name");
            return Errno::from(e).as_ret();
        }
    };
    let Ok(name) = core::str::from_utf8(&namebuf[..name_len]) else {
        return Errno::Inval.as_ret();
    };

    let mut msg: IotapMsg = match copyin_value(u_msg) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("muxtap: bad address for message");
            return Errno::from(e).as_ret();
        }
    };

    if msg.buf == 0 || msg.len == 0 {
        return Errno::Inval.as_ret();
    }
    // Truncate if needed.
    if msg.len >= IOTAP_MSG_MAX {
        msg.len = IOTAP_MSG_MAX;
    }

    let mut bounce = alloc::vec![0u8; msg.len];
    match mux(name, msg.opcode, &mut bounce) {
        Ok(n) => {
            if n > 0 {
                if let Err(e) = copyout(&bounce[..n], msg.buf) {
                    return Errno::from(e).as_ret();
                }
            }
            n as isize
        }
        Err(e) => Errno::from(e).as_ret(),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct TwoByteTap;

    impl IotapOps for TwoByteTap {
        fn read(&self, _desc: &IotapDesc, buf: &mut [u8]) -> KernelResult<usize> {
            let n = buf.len().min(2);
            for (i, slot) in buf.iter_mut().take(n).enumerate() {
                *slot = 0xA0 + i as u8;
            }
            Ok(n)
        }
    }

    static TAP: TwoByteTap = TwoByteTap;

    #[test]
    fn register_then_lookup_preserves_name_and_ops() {
        let id = register("input.kbd", &TAP).expect("registration");
        let desc = lookup("input.kbd").expect("lookup after register");
        assert_eq!(desc.name, "input.kbd");
        assert_eq!(desc.id, id);
    }

    #[test]
    fn mux_read_returns_short_counts() {
        register("input.short", &TAP).expect("registration");

        // Ask for four bytes; the tap produces two.
        let mut buf = [0u8; 4];
        let n = mux("input.short", IOTAP_OPC_READ, &mut buf).expect("mux read");
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[0xA0, 0xA1]);
    }

    #[test]
    fn unknown_names_and_opcodes_fail() {
        assert_eq!(
            mux("input.ghost", IOTAP_OPC_READ, &mut [0u8; 4]).err(),
            Some(KernelError::NotFound)
        );

        register("input.opc", &TAP).expect("registration");
        assert_eq!(
            mux("input.opc", 99, &mut [0u8; 4]).err(),
            Some(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn ids_are_monotonic() {
        let a = register("tap.mono.a", &TAP).expect("a");
        let b = register("tap.mono.b", &TAP).expect("b");
        assert!(b > a);
    }
}
