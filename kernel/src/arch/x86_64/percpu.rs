//! Per-core descriptors
//!
//! One `PerCore` per processor, allocated at bring-up and never destroyed.
//! The descriptor's own address is kept in `GS_BASE` while the core runs in
//! the kernel (swapped against the user value at every privilege crossing),
//! so "which core am I on" is a single register load from any context.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::AtomicUsize;

use spin::Mutex;
use x86_64::structures::gdt::GlobalDescriptorTable;
use x86_64::structures::tss::TaskStateSegment;

use super::gdt::Selectors;
use crate::process::Process;
use crate::sched::queue::RunQueue;

/// Hard cap on supported cores; firmware-reported extras are not started.
pub const CPU_MAX: usize = 32;

/// Processor vendor, from CPUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Amd,
    Intel,
    Other,
}

/// Descriptor tables a core hands to the hardware. Leaked separately from
/// the rest of the per-core state: once loaded, the processor itself keeps
/// references into them.
pub struct CoreTables {
    pub gdt: GlobalDescriptorTable,
    pub tss: TaskStateSegment,
}

/// Machine-dependent block of a per-core descriptor.
pub struct MdCore {
    pub selectors: Option<Selectors>,
    pub apic_id: u32,
    pub lapic_base: u64,
    pub lapic_timer_hz: u64,
    pub x2apic: bool,
    pub vendor: CpuVendor,
    pub family: u32,
    pub cr3: u64,
}

impl MdCore {
    fn new() -> Self {
        Self {
            selectors: None,
            apic_id: 0,
            lapic_base: 0,
            lapic_timer_hz: 0,
            x2apic: false,
            vendor: CpuVendor::Other,
            family: 0,
            cr3: 0,
        }
    }
}

/// Logical description of one processor core.
pub struct PerCore {
    /// Logical id: 0 is the bootstrap processor, secondaries count up.
    pub id: u32,
    /// Process currently running on this core.
    curproc: Mutex<Option<Arc<Process>>>,
    /// This core's scheduler queue.
    pub runq: RunQueue,
    /// Machine-dependent state.
    pub md: Mutex<MdCore>,
    /// Chain pointer to self, installed in GS_BASE.
    self_ptr: *const PerCore,
}

// SAFETY: the self pointer always refers to the (leaked, immortal) PerCore
// itself; all mutable state is behind locks or atomics.
unsafe impl Send for PerCore {}
// SAFETY: as above.
unsafe impl Sync for PerCore {}

impl PerCore {
    /// Current process on this core.
    pub fn curproc(&self) -> Option<Arc<Process>> {
        self.curproc.lock().clone()
    }

    /// Replace the current process, returning the previous one.
    pub fn set_curproc(&self, proc: Option<Arc<Process>>) -> Option<Arc<Process>> {
        core::mem::replace(&mut *self.curproc.lock(), proc)
    }
}

/// All registered cores, indexed by logical id.
static CORE_LIST: Mutex<[Option<&'static PerCore>; CPU_MAX]> = Mutex::new([None; CPU_MAX]);

/// Cores that have completed bring-up. Secondaries increment with release
/// ordering; the bootstrap spin uses acquire.
pub static CORES_UP: AtomicUsize = AtomicUsize::new(1);

/// Allocate a core descriptor. The allocation is leaked by design: per-core
/// state lives until power-off.
pub fn alloc_core(id: u32) -> &'static PerCore {
    let core = Box::leak(Box::new(PerCore {
        id,
        curproc: Mutex::new(None),
        runq: RunQueue::new(),
        md: Mutex::new(MdCore::new()),
        self_ptr: core::ptr::null(),
    }));
    let ptr = core as *const PerCore;
    core.self_ptr = ptr;
    core
}

/// Enter a core into the list under its logical id.
pub fn register(core: &'static PerCore) {
    let mut list = CORE_LIST.lock();
    let idx = core.id as usize;
    if idx < CPU_MAX {
        list[idx] = Some(core);
    }
}

/// Get a core descriptor by logical id.
pub fn cpu_get(index: usize) -> Option<&'static PerCore> {
    let list = CORE_LIST.lock();
    if index < CPU_MAX {
        list[index]
    } else {
        None
    }
}

/// The core we are executing on, via the GS-held self pointer. `None`
/// before per-core setup has run.
#[cfg(target_os = "none")]
pub fn this_core() -> Option<&'static PerCore> {
    use x86_64::registers::model_specific::GsBase;
    let ptr = GsBase::read().as_u64();
    if ptr == 0 {
        return None;
    }
    // SAFETY: GS_BASE only ever holds the address of a leaked PerCore,
    // installed by cpu_conf on this very core.
    Some(unsafe { &*(ptr as *const PerCore) })
}

/// Host builds have no per-core register state.
#[cfg(not(target_os = "none"))]
pub fn this_core() -> Option<&'static PerCore> {
    None
}

/// Configure the calling core: identify the processor, build descriptor
/// tables, and install the self pointer. First-stage setup, no interrupt
/// sources are touched yet.
#[cfg(target_os = "none")]
pub fn cpu_conf(core: &'static PerCore) {
    use raw_cpuid::CpuId;
    use x86_64::registers::model_specific::{GsBase, KernelGsBase};
    use x86_64::VirtAddr;

    {
        let mut md = core.md.lock();

        let cpuid = CpuId::new();
        md.vendor = match cpuid.get_vendor_info() {
            Some(v) if v.as_str() == "AuthenticAMD" => CpuVendor::Amd,
            Some(v) if v.as_str() == "GenuineIntel" => CpuVendor::Intel,
            _ => CpuVendor::Other,
        };
        if let Some(f) = cpuid.get_feature_info() {
            md.family = f.family_id() as u32;
            md.x2apic = f.has_x2apic();
            md.apic_id = f.initial_local_apic_id() as u32;
        }
        md.cr3 = crate::mm::Vas::current().root();

        // The hardware keeps referencing these tables after load, so they
        // are leaked rather than owned by the descriptor.
        let tables = Box::leak(Box::new(CoreTables {
            gdt: GlobalDescriptorTable::new(),
            tss: TaskStateSegment::new(),
        }));
        // SAFETY: `tables` is leaked and we are running on this core;
        // cpu_conf runs once per core.
        md.selectors =
            Some(unsafe { super::gdt::init_core_tables(&mut tables.gdt, &mut tables.tss) });
    }

    // Self pointer: kernel GS holds the descriptor, user GS starts empty.
    GsBase::write(VirtAddr::new(core.self_ptr as u64));
    KernelGsBase::write(VirtAddr::new(0));

    register(core);
}

/// Second-stage per-core init: interrupt table and local interrupt
/// controller. Split from `cpu_conf` so the BSP can bring memory and ACPI
/// up between the two stages.
#[cfg(target_os = "none")]
pub fn cpu_init(core: &'static PerCore) {
    super::idt::load();
    super::apic::init(core);
}
