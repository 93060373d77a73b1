//! I/O APIC
//!
//! External interrupt router. Registers are reached indirectly: write the
//! register index to IOREGSEL, then read or write the value through IOWIN.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::phys_to_virt;

const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

/// Redirection table base; each entry is two 32-bit registers.
const IOAPIC_REDTBL_BASE: u32 = 0x10;

/// Redirection entry mask bit (low dword, bit 16).
const REDTBL_MASK: u32 = 1 << 16;

static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0);
static GSI_BASE: AtomicU64 = AtomicU64::new(0);

/// Record the router's MMIO base (from the MADT).
pub fn init(base_pa: u64, gsi_base: u32) {
    IOAPIC_BASE.store(base_pa, Ordering::Release);
    GSI_BASE.store(gsi_base as u64, Ordering::Release);
    log::info!("ioapic: base {:#x}, gsi base {}", base_pa, gsi_base);
}

fn mmio() -> Option<*mut u32> {
    let base = IOAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        return None;
    }
    Some(phys_to_virt(base) as *mut u32)
}

unsafe fn reg_write(reg: u32, value: u32) {
    let Some(base) = mmio() else { return };
    // SAFETY: IOREGSEL/IOWIN are the architectural indirect access pair;
    // the caller passes a valid register index.
    unsafe {
        core::ptr::write_volatile(base.add(IOREGSEL / 4), reg);
        core::ptr::write_volatile(base.add(IOWIN / 4), value);
    }
}

unsafe fn reg_read(reg: u32) -> u32 {
    let Some(base) = mmio() else { return 0 };
    // SAFETY: as in `reg_write`.
    unsafe {
        core::ptr::write_volatile(base.add(IOREGSEL / 4), reg);
        core::ptr::read_volatile(base.add(IOWIN / 4))
    }
}

/// Global system interrupt for a legacy IRQ line. Identity for now; ISA
/// overrides from the MADT would slot in here.
pub fn irq_to_gsi(irq: u8) -> u32 {
    irq as u32
}

/// Steer `irq` to the given interrupt vector on the bootstrap processor.
pub fn route_vec(irq: u8, vector: u8) {
    let gsi = irq_to_gsi(irq);
    let index = IOAPIC_REDTBL_BASE + 2 * (gsi - GSI_BASE.load(Ordering::Acquire) as u32);
    // SAFETY: redirection entries are paired registers; high dword selects
    // the destination APIC (BSP, id 0), low dword the vector with fixed
    // delivery and the line initially masked.
    unsafe {
        reg_write(index + 1, 0);
        reg_write(index, vector as u32 | REDTBL_MASK);
    }
}

/// Mask or unmask a global system interrupt. The mask bit follows the
/// caller's argument.
pub fn gsi_mask(gsi: u32, masked: bool) {
    let index = IOAPIC_REDTBL_BASE + 2 * (gsi - GSI_BASE.load(Ordering::Acquire) as u32);
    // SAFETY: read-modify-write of the low dword of one redirection entry.
    unsafe {
        let low = reg_read(index);
        if masked {
            reg_write(index, low | REDTBL_MASK);
        } else {
            reg_write(index, low & !REDTBL_MASK);
        }
    }
}
