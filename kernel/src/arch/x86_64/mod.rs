//! x86_64 machine-dependent code

pub mod acpi;
pub mod apic;
#[cfg(target_os = "none")]
pub mod context;
pub mod gdt;
pub mod idt;
pub mod ioapic;
pub mod percpu;
pub mod reboot;
#[cfg(target_os = "none")]
pub mod smp;
pub mod trap;

/// Remap and mask the legacy 8259 PICs so the I/O APIC owns external
/// interrupt routing.
#[cfg(target_os = "none")]
pub fn disable_legacy_pics() {
    use pic8259::ChainedPics;

    // SAFETY: remapping to vectors 0x20/0x28 keeps spurious legacy IRQs
    // away from the exception range before the lines are masked.
    unsafe {
        let mut pics = ChainedPics::new(0x20, 0x28);
        pics.initialize();
        pics.disable();
    }
}

/// Mask interrupts on this core.
pub fn interrupts_off() {
    x86_64::instructions::interrupts::disable();
}

/// Stop the world on this core.
pub fn halt() -> ! {
    trap::halt_forever()
}
