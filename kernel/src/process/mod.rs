//! Process model
//!
//! A process owns its PCB, its address space, its recorded mapping ranges
//! and anything reachable from its environment block; file-descriptor
//! entries share vnodes with the rest of the VFS. The parent link is a
//! weak relation by PID -- it survives parent exit without ever being
//! dereferenced directly.

pub mod creation;
pub mod exit;
pub mod pcb;

pub use creation::{proc_init, spawn};
pub use exit::{kill_current_and_reschedule, proc_kill};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::fs::file::FileDesc;
use crate::ptrbox::PtrBox;
use crate::security::mac::MacLevel;
use crate::signal::{SigAction, SigTable, NSIG};
use crate::syscall::domain::SyscallDomain;
use pcb::MdPcb;

/// Process identifier.
pub type Pid = u64;

/// The user stack starts here and grows down.
pub const STACK_TOP: u64 = 0xBFFF_FFFF;
/// User stack length.
pub const STACK_LEN: usize = 4096;
/// Argument block mapping base, below the stack page.
pub const ARGV_BASE: u64 = 0xBFFF_A000;

/// File descriptor table size.
pub const FD_MAX: usize = 32;

bitflags! {
    /// Process state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcFlags: u32 {
        /// Process is on its way out.
        const EXITING = 1 << 0;
        /// Process is parked on a wait object.
        const SLEEPING = 1 << 1;
        /// Kernel thread, no user half.
        const KTD = 1 << 2;
    }
}

/// One mapping installed on behalf of this process. The list is the
/// authoritative source for teardown: every recorded range's backing
/// frames are released at exit.
#[derive(Debug, Clone, Copy)]
pub struct VmRange {
    pub phys_base: u64,
    pub virt_base: u64,
    pub len: usize,
}

/// Environment block: where spawn put the argument vector in the
/// process's own user memory.
#[derive(Debug, Default)]
pub struct EnvBlk {
    /// User VA of the NULL-terminated pointer array.
    pub argv_ptr: u64,
    /// User VAs of the individual argument strings.
    pub argv: Vec<u64>,
    /// Argument count.
    pub argc: u16,
}

/// A process describes a running program image on the system.
pub struct Process {
    pid: Pid,
    flags: AtomicU32,
    /// Machine-dependent block: saved trap frame and owned VAS.
    pub pcb: Mutex<MdPcb>,
    /// Syscall windows and the platform latch.
    pub scdom: SyscallDomain,
    /// Open files. Entries are shared references into the VFS.
    pub fdtab: Mutex<[Option<FileDesc>; FD_MAX]>,
    /// Argument block bookkeeping.
    pub envblk: Mutex<Option<EnvBlk>>,
    /// Arena owning heap data reachable from the env block.
    pub envblk_box: Mutex<PtrBox>,
    /// Parent PID; weak by design.
    parent: Option<Pid>,
    /// MAC access level.
    level: MacLevel,
    /// Recorded mapping ranges, under their own lock.
    ranges: Mutex<Vec<VmRange>>,
    /// Signal actions.
    pub sigtab: Mutex<SigTable>,
    /// Exit bookkeeping for waitpid.
    zombie: AtomicBool,
    exit_status: AtomicI32,
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Global process table, keyed by PID.
static PROC_TABLE: Mutex<BTreeMap<Pid, Arc<Process>>> = Mutex::new(BTreeMap::new());

impl Process {
    /// Allocate a process shell with a fresh PID. Machine-dependent setup
    /// (VAS, stack, trap frame) happens in `proc_init`.
    pub(crate) fn new_bare(parent: Option<Pid>, level: MacLevel) -> Arc<Process> {
        Arc::new(Process {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            flags: AtomicU32::new(0),
            pcb: Mutex::new(MdPcb::empty()),
            scdom: SyscallDomain::new(),
            fdtab: Mutex::new([const { None }; FD_MAX]),
            envblk: Mutex::new(None),
            envblk_box: Mutex::new(PtrBox::new()),
            parent,
            level,
            ranges: Mutex::new(Vec::new()),
            sigtab: Mutex::new([SigAction::default(); NSIG]),
            zombie: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
        })
    }

    /// Bare process for host-side unit tests, with a chosen PID.
    #[cfg(not(target_os = "none"))]
    pub fn for_tests(pid: Pid) -> Arc<Process> {
        let proc = Self::new_bare(None, MacLevel::Global);
        // PIDs are monotonic; tests want stable ones, so rebuild the Arc
        // with the requested value.
        let mut raw = Arc::try_unwrap(proc).ok().expect("fresh process is unshared");
        raw.pid = pid;
        Arc::new(raw)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn level(&self) -> MacLevel {
        self.level
    }

    pub fn flags(&self) -> ProcFlags {
        ProcFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: ProcFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: ProcFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Record a successful user mapping for teardown.
    pub fn add_range(&self, virt_base: u64, phys_base: u64, len: usize) {
        self.ranges.lock().push(VmRange {
            phys_base,
            virt_base,
            len,
        });
    }

    /// The range record containing `[addr, addr + len)`, if any single
    /// record covers the whole span.
    pub fn range_covering(&self, addr: u64, len: u64) -> Option<VmRange> {
        let ranges = self.ranges.lock();
        ranges
            .iter()
            .find(|r| {
                addr >= r.virt_base && addr + len <= r.virt_base + r.len as u64
            })
            .copied()
    }

    /// Drain the range list for teardown.
    pub(crate) fn take_ranges(&self) -> Vec<VmRange> {
        core::mem::take(&mut *self.ranges.lock())
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::Acquire)
    }

    pub(crate) fn mark_zombie(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
        self.zombie.store(true, Ordering::Release);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }
}

/// Enter a process into the global table.
pub fn register(proc: &Arc<Process>) {
    PROC_TABLE.lock().insert(proc.pid, proc.clone());
}

/// Remove a process from the global table.
pub fn unregister(pid: Pid) {
    PROC_TABLE.lock().remove(&pid);
}

/// Look up a process by PID.
pub fn lookup(pid: Pid) -> Option<Arc<Process>> {
    PROC_TABLE.lock().get(&pid).cloned()
}

/// The process currently running on this core, if any.
pub fn current() -> Option<Arc<Process>> {
    crate::arch::x86_64::percpu::this_core()?.curproc()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn range_covering_requires_single_record_containment() {
        let proc = Process::for_tests(100);
        proc.add_range(0x40_0000, 0x10_0000, 0x2000);
        proc.add_range(0x40_2000, 0x12_0000, 0x1000);

        assert!(proc.range_covering(0x40_0000, 0x2000).is_some());
        assert!(proc.range_covering(0x40_1000, 0x800).is_some());
        // Spans two records: no single record covers it.
        assert!(proc.range_covering(0x40_1000, 0x1800).is_none());
        assert!(proc.range_covering(0xdead_b000, 4).is_none());
    }

    #[test]
    fn flags_set_and_clear() {
        let proc = Process::for_tests(101);
        assert!(proc.flags().is_empty());
        proc.set_flag(ProcFlags::SLEEPING);
        assert!(proc.flags().contains(ProcFlags::SLEEPING));
        proc.clear_flag(ProcFlags::SLEEPING);
        assert!(!proc.flags().contains(ProcFlags::SLEEPING));
    }

    #[test]
    fn table_register_lookup_unregister() {
        let proc = Process::for_tests(4242);
        register(&proc);
        assert!(lookup(4242).is_some());
        unregister(4242);
        assert!(lookup(4242).is_none());
    }
}
