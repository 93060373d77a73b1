//! Kernel entry point
//!
//! Boot order: console and logging first, then the boot-vars snapshot,
//! memory management, ACPI, the bootstrap core, clocks, the interrupt
//! router, the application processors, the VFS, the scheduler, and
//! finally the root process.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use core::panic::PanicInfo;

    use bootloader_api::config::{BootloaderConfig, Mapping};
    use bootloader_api::BootInfo;
    use obsidian_kernel::arch::x86_64::{self, percpu};
    use obsidian_kernel::{
        bootvars, fs, logger, mm, process, sched, serial_println, time,
    };

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    bootloader_api::entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        x86_64::disable_legacy_pics();
        logger::init();

        obsidian_kernel::println!("ObsidianOS v{}", env!("CARGO_PKG_VERSION"));
        obsidian_kernel::println!("booting kernel core...");

        bootvars::init(boot_info);
        mm::init();
        x86_64::acpi::early_init();

        // Bootstrap core: descriptor tables, vector table, local APIC.
        let bsp = percpu::alloc_core(0);
        percpu::cpu_conf(bsp);
        percpu::cpu_init(bsp);

        time::init();
        if let Some(madt) = x86_64::acpi::madt_info() {
            x86_64::ioapic::init(madt.ioapic_addr, madt.ioapic_gsi_base);
        }

        x86_64::smp::bsp_ap_startup();

        fs::init();
        sched::init();

        match process::spawn("/bin/init", &[]) {
            Ok(pid) => obsidian_kernel::println!("init is pid {}", pid),
            Err(e) => panic!("could not load init: {}", e),
        }

        // The idle loop picks init off this core's queue and kicks it.
        sched::idle_loop()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        x86_64::interrupts_off();
        obsidian_kernel::arch::x86_64::apic::broadcast_halt();

        // The serial lock may be held by whatever path blew up; break it
        // so the report always gets out.
        // SAFETY: every other core is halted and this one never returns.
        unsafe { obsidian_kernel::serial::SERIAL1.force_unlock() };
        serial_println!("[KERNEL PANIC] {}", info);

        obsidian_kernel::arch::x86_64::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
