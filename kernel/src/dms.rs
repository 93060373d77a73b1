//! Disk mux subsystem (DMS)
//!
//! Registry of block devices with monotonic ids and a frame-based I/O
//! syscall. Transfers bounce through kernel buffers aligned up to the
//! disk's block size.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use spin::Mutex;

use crate::error::{Errno, KernelError, KernelResult};
use crate::mm::user_validation::{copyin, copyin_value, copyout};
use crate::syscall::SyscallArgs;

/// Longest disk name, terminator included.
pub const DISKNAME_MAX: usize = 32;

/// Frame opcodes.
pub const DMS_OPC_READ: u8 = 0x00;
pub const DMS_OPC_WRITE: u8 = 0x01;
pub const DMS_OPC_QUERY: u8 = 0x02;

/// Disk identifier.
pub type DiskId = u16;

/// Device operation hooks.
pub trait DmsOps: Send + Sync {
    fn read(&self, disk: &DmsDisk, buf: &mut [u8], off: i64) -> KernelResult<usize>;
    fn write(&self, disk: &DmsDisk, buf: &[u8], off: i64) -> KernelResult<usize>;
}

/// A registered disk.
pub struct DmsDisk {
    pub name: String,
    pub id: DiskId,
    pub bsize: usize,
    ops: &'static dyn DmsOps,
}

/// Data that can be sent between the DMS framework and user applications.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmsFrame {
    pub id: DiskId,
    pub opcode: u8,
    pub buf: u64,
    pub offset: i64,
    pub len: usize,
}

/// Answer to a QUERY frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DmsDiskInfo {
    pub name: [u8; DISKNAME_MAX],
    pub bsize: usize,
    pub id: DiskId,
}

static DISKQ: Mutex<Vec<Arc<DmsDisk>>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU16 = AtomicU16::new(0);

/// Register a disk with the mux.
pub fn register(name: &str, bsize: usize, ops: &'static dyn DmsOps) -> KernelResult<Arc<DmsDisk>> {
    if name.is_empty() || bsize == 0 {
        return Err(KernelError::InvalidArgument);
    }
    if name.len() >= DISKNAME_MAX - 1 {
        return Err(KernelError::NameTooLong);
    }

    let disk = Arc::new(DmsDisk {
        name: name.to_string(),
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        bsize,
        ops,
    });
    DISKQ.lock().push(disk.clone());
    Ok(disk)
}

/// Fetch the disk matching `disk_id`, or nothing.
pub fn dms_get(disk_id: DiskId) -> Option<Arc<DmsDisk>> {
    DISKQ
        .lock()
        .iter()
        .find(|d| d.id == disk_id)
        .cloned()
}

/// Read from a disk through a block-aligned bounce buffer.
pub fn dms_read(disk: &DmsDisk, buf: &mut [u8], off: i64) -> KernelResult<usize> {
    let real_len = buf.len().div_ceil(disk.bsize) * disk.bsize;
    let mut bounce = alloc::vec![0u8; real_len];
    disk.ops.read(disk, &mut bounce, off)?;
    buf.copy_from_slice(&bounce[..buf.len()]);
    Ok(buf.len())
}

/// Write to a disk through a block-aligned, zero-padded bounce buffer.
pub fn dms_write(disk: &DmsDisk, buf: &[u8], off: i64) -> KernelResult<usize> {
    let real_len = buf.len().div_ceil(disk.bsize) * disk.bsize;
    let mut bounce = alloc::vec![0u8; real_len];
    bounce[..buf.len()].copy_from_slice(buf);
    disk.ops.write(disk, &bounce, off)?;
    Ok(buf.len())
}

fn dms_io(frame: &DmsFrame) -> KernelResult<usize> {
    if frame.len == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let disk = dms_get(frame.id).ok_or(KernelError::NoDevice)?;

    match frame.opcode {
        DMS_OPC_READ => {
            let mut bounce = alloc::vec![0u8; frame.len];
            let n = dms_read(&disk, &mut bounce, frame.offset)?;
            copyout(&bounce[..n], frame.buf)?;
            Ok(n)
        }
        DMS_OPC_WRITE => {
            let mut bounce = alloc::vec![0u8; frame.len];
            copyin(frame.buf, &mut bounce)?;
            dms_write(&disk, &bounce, frame.offset)
        }
        DMS_OPC_QUERY => {
            let mut info = DmsDiskInfo {
                name: [0; DISKNAME_MAX],
                bsize: disk.bsize,
                id: disk.id,
            };
            info.name[..disk.name.len()].copy_from_slice(disk.name.as_bytes());

            let len = frame.len.min(core::mem::size_of::<DmsDiskInfo>());
            // SAFETY: DmsDiskInfo is plain old data; at most its size is
            // copied.
            let bytes = unsafe {
                core::slice::from_raw_parts(&info as *const DmsDiskInfo as *const u8, len)
            };
            copyout(bytes, frame.buf)?;
            Ok(len)
        }
        _ => Err(KernelError::NotSupported),
    }
}

/// DMS I/O syscall. ARG0: frame pointer.
pub fn sys_dmsio(args: &mut SyscallArgs) -> isize {
    let u_frame = args.arg(0);
    let frame: DmsFrame = match copyin_value(u_frame) {
        Ok(f) => f,
        Err(e) => return Errno::from(e).as_ret(),
    };

    match dms_io(&frame) {
        Ok(n) => n as isize,
        Err(e) => Errno::from(e).as_ret(),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use spin::Mutex as TestMutex;

    /// Remembers the lengths it was handed, to observe block alignment.
    struct RecordingDisk {
        last_len: TestMutex<usize>,
    }

    impl DmsOps for RecordingDisk {
        fn read(&self, _disk: &DmsDisk, buf: &mut [u8], _off: i64) -> KernelResult<usize> {
            *self.last_len.lock() = buf.len();
            buf.fill(0x5A);
            Ok(buf.len())
        }

        fn write(&self, _disk: &DmsDisk, buf: &[u8], _off: i64) -> KernelResult<usize> {
            *self.last_len.lock() = buf.len();
            Ok(buf.len())
        }
    }

    static DISK_A: RecordingDisk = RecordingDisk {
        last_len: TestMutex::new(0),
    };
    static DISK_B: RecordingDisk = RecordingDisk {
        last_len: TestMutex::new(0),
    };

    #[test]
    fn get_returns_the_matching_disk_not_the_last_seen() {
        let a = register("wd0", 512, &DISK_A).expect("register wd0");
        let b = register("wd1", 512, &DISK_B).expect("register wd1");

        let got = dms_get(a.id).expect("first disk resolvable");
        assert_eq!(got.name, "wd0");
        let got = dms_get(b.id).expect("second disk resolvable");
        assert_eq!(got.name, "wd1");

        assert!(dms_get(0xFFFF).is_none(), "unknown ids resolve to nothing");
    }

    #[test]
    fn io_lengths_are_block_aligned() {
        let disk = register("aligned0", 512, &DISK_A).expect("register");

        let mut buf = [0u8; 100];
        dms_read(&disk, &mut buf, 0).expect("read");
        assert_eq!(*DISK_A.last_len.lock(), 512, "reads round up to the block size");
        assert_eq!(buf[0], 0x5A);

        dms_write(&disk, &[1u8; 700], 0).expect("write");
        assert_eq!(*DISK_A.last_len.lock(), 1024, "writes round up and zero-pad");
    }

    #[test]
    fn overlong_names_are_refused() {
        let name = "d".repeat(DISKNAME_MAX);
        assert_eq!(
            register(&name, 512, &DISK_A).err(),
            Some(KernelError::NameTooLong)
        );
    }
}
