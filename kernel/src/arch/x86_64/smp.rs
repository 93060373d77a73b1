//! Multiprocessor bring-up
//!
//! The boot protocol hands over only the bootstrap processor, so the
//! kernel runs the Intel MP startup sequence itself: secondaries are
//! enumerated from the MADT, a real-mode trampoline is published in low
//! memory, and each target gets INIT then two STARTUP IPIs. Every
//! secondary allocates its own descriptor, takes the next sequential
//! logical id, runs the same per-core configuration as the bootstrap, and
//! finishes with a release increment of `cores_up`; the bootstrap spins
//! with acquire until the expected count (truncated at `CPU_MAX`) is
//! reached. Secondaries then halt awaiting their timer.

use core::sync::atomic::Ordering;

use spin::Mutex;

use super::{acpi, apic, percpu};
use crate::mm::{phys_to_virt, vm_alloc_frame, PAGE_SIZE};

/// Where the startup trampoline is published (SIPI vector 0x08).
const AP_TRAMPOLINE_PA: u64 = 0x8000;
/// Handoff block read by the trampoline: CR3, stack top, Rust entry.
const AP_HANDOFF_PA: u64 = 0x7000;

/// Kernel stack pages per secondary.
const AP_STACK_PAGES: usize = 4;

// Real-mode startup code. A SIPI drops the target at 0x8000 in 16-bit
// mode; the trampoline enables PAE and long mode with the kernel's boot
// CR3, then jumps into `ap_entry` on the stack the BSP prepared.
core::arch::global_asm!(
    ".section .text",
    ".code16",
    ".global ap_tramp_start",
    "ap_tramp_start:",
    "cli",
    "cld",
    "lgdt [{tramp} + (ap_tramp_gdtr - ap_tramp_start)]",
    // CR4.PAE
    "mov eax, cr4",
    "or eax, 0x20",
    "mov cr4, eax",
    // Boot CR3 from the handoff block
    "mov eax, dword ptr [{handoff}]",
    "mov cr3, eax",
    // EFER.LME
    "mov ecx, 0xC0000080",
    "rdmsr",
    "or eax, 0x100",
    "wrmsr",
    // CR0.PG | CR0.PE: straight from real mode into long mode
    "mov eax, cr0",
    "or eax, 0x80000001",
    "mov cr0, eax",
    // data32 far jump ptr16:32 into the 64-bit tail
    ".byte 0x66, 0xEA",
    ".long {tramp} + (ap_tramp_long - ap_tramp_start)",
    ".word 0x08",
    ".code64",
    "ap_tramp_long:",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    "mov rsp, qword ptr [{handoff} + 8]",
    "mov rax, qword ptr [{handoff} + 16]",
    "jmp rax",
    ".balign 8",
    "ap_tramp_gdt:",
    ".quad 0",
    ".quad 0x00AF9A000000FFFF", // 64-bit code
    ".quad 0x00CF92000000FFFF", // data
    "ap_tramp_gdtr:",
    ".word (ap_tramp_gdtr - ap_tramp_gdt) - 1",
    ".long {tramp} + (ap_tramp_gdt - ap_tramp_start)",
    ".global ap_tramp_end",
    "ap_tramp_end:",
    tramp = const AP_TRAMPOLINE_PA,
    handoff = const AP_HANDOFF_PA,
);

extern "C" {
    static ap_tramp_start: u8;
    static ap_tramp_end: u8;
}

/// Serializes secondary allocation and registration.
static AP_LOCK: Mutex<()> = Mutex::new(());

/// Secondary entry point, in long mode on the handoff stack.
extern "C" fn ap_entry() -> ! {
    {
        let _guard = AP_LOCK.lock();

        let id = percpu::CORES_UP.load(Ordering::Relaxed) as u32;
        let core = percpu::alloc_core(id);
        percpu::cpu_conf(core);
        percpu::cpu_init(core);

        percpu::CORES_UP.fetch_add(1, Ordering::Release);
    }

    // Halt awaiting interrupts; the scheduler's timer does the waking.
    crate::sched::idle_loop()
}

/// Publish the trampoline and handoff block in low memory.
fn install_trampoline(stack_top: u64) {
    // SAFETY: the first megabyte is firmware-reserved, identity-covered by
    // the physical mapping, and not handed to the frame allocator.
    unsafe {
        let start = &ap_tramp_start as *const u8;
        let end = &ap_tramp_end as *const u8;
        let len = end as usize - start as usize;
        core::ptr::copy_nonoverlapping(start, phys_to_virt(AP_TRAMPOLINE_PA), len);

        let handoff = phys_to_virt(AP_HANDOFF_PA) as *mut u64;
        handoff.write(crate::mm::Vas::boot().root());
        handoff.add(1).write(stack_top);
        handoff.add(2).write(ap_entry as usize as u64);
    }
}

/// Bring the application processors online from the bootstrap processor.
pub fn bsp_ap_startup() {
    let Some(madt) = acpi::madt_info() else {
        log::warn!("mp: no MADT; staying single-core");
        return;
    };

    let Some(bsp) = percpu::this_core() else {
        panic!("mp: bootstrap core not configured");
    };
    let bsp_apic_id = bsp.md.lock().apic_id;

    let ncores = madt.lapic_ids.len().min(percpu::CPU_MAX);
    if madt.lapic_ids.len() > ncores {
        log::warn!("mp: not starting {} cores", madt.lapic_ids.len() - ncores);
    }
    if ncores <= 1 {
        log::info!("mp: single cored machine - no secondaries to bring up");
        return;
    }

    log::info!("mp: bringing {} secondaries online...", ncores - 1);
    let sipi_vector = (AP_TRAMPOLINE_PA >> 12) as u8;

    let mut expected = 1usize;
    for &apic_id in madt.lapic_ids.iter().take(ncores) {
        if apic_id == bsp_apic_id {
            continue;
        }

        // A fresh stack per secondary; bring-up allocation failure is
        // fatal by policy.
        let stack = vm_alloc_frame(AP_STACK_PAGES);
        if stack == 0 {
            panic!("mp: could not allocate secondary stack");
        }
        let stack_top = phys_to_virt(stack) as u64 + (AP_STACK_PAGES * PAGE_SIZE) as u64;
        install_trampoline(stack_top);

        let before = percpu::CORES_UP.load(Ordering::Acquire);
        apic::send_init(apic_id);
        crate::time::busy_udelay(10_000);
        apic::send_sipi(apic_id, sipi_vector);
        crate::time::busy_udelay(200);
        apic::send_sipi(apic_id, sipi_vector);

        // Wait for this secondary to count itself in before reusing the
        // trampoline for the next one.
        let mut spins = 0u64;
        while percpu::CORES_UP.load(Ordering::Acquire) == before {
            core::hint::spin_loop();
            spins += 1;
            if spins > 500_000_000 {
                log::warn!("mp: core with apic id {} did not come up", apic_id);
                break;
            }
        }
        if percpu::CORES_UP.load(Ordering::Acquire) != before {
            expected += 1;
        }
    }

    // The release increments pair with this acquire spin.
    while percpu::CORES_UP.load(Ordering::Acquire) < expected {
        core::hint::spin_loop();
    }
    log::info!("mp: {} cores [up]", percpu::CORES_UP.load(Ordering::Acquire));
}
