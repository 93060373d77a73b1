//! System reset
//!
//! Reset via the keyboard controller's pulse line, falling back to a
//! triple fault if the controller does not cooperate.

use x86_64::instructions::port::Port;

/// Pulse the reset line. Does not return on success.
pub fn cpu_reset() -> ! {
    let mut status: Port<u8> = Port::new(0x64);

    // SAFETY: architectural i8042 command port; 0xFE pulses the reset line.
    unsafe {
        for _ in 0..16 {
            if status.read() & 0x02 == 0 {
                status.write(0xFE);
            }
        }
    }

    // Still here: force a triple fault by loading an empty IDT and firing
    // an interrupt through it.
    // SAFETY: this is the point of no return by construction.
    unsafe {
        use x86_64::structures::DescriptorTablePointer;
        let empty = DescriptorTablePointer {
            limit: 0,
            base: x86_64::VirtAddr::new(0),
        };
        x86_64::instructions::tables::lidt(&empty);
        core::arch::asm!("int3", options(noreturn));
    }
}
