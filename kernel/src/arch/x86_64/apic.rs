//! Local APIC
//!
//! Per-core interrupt controller: end-of-interrupt signalling, the one-shot
//! scheduler timer, and inter-processor interrupts (fixed, INIT, SIPI and
//! the broadcast halt used by panic). Registers are accessed through the
//! xAPIC MMIO window; the x2APIC capability is recorded but the MMIO
//! interface is used either way.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;

use super::percpu::PerCore;
use super::trap;
use crate::mm::phys_to_virt;

/// IA32_APIC_BASE MSR: holds the APIC MMIO base and the global enable bit.
const IA32_APIC_BASE_MSR: u32 = 0x1B;
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

// Register offsets (bytes from the MMIO base).
const LAPIC_ID: u32 = 0x020;
const LAPIC_TPR: u32 = 0x080;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_ICR_LOW: u32 = 0x300;
const LAPIC_ICR_HIGH: u32 = 0x310;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;
/// LVT timer one-shot mode (bits 18:17 = 00) is the default.
const TIMER_MODE_ONESHOT: u32 = 0;
/// Divide configuration: divide by 16.
const TIMER_DIV_16: u32 = 0b0011;

/// ICR delivery modes.
const ICR_FIXED: u32 = 0b000 << 8;
const ICR_INIT: u32 = 0b101 << 8;
const ICR_STARTUP: u32 = 0b110 << 8;
/// ICR level assert.
const ICR_ASSERT: u32 = 1 << 14;
/// ICR destination shorthand: all excluding self.
const ICR_ALL_BUT_SELF: u32 = 0b11 << 18;
/// ICR delivery status bit: still pending.
const ICR_PENDING: u32 = 1 << 12;

/// Calibrated LAPIC timer frequency (ticks per second at divide-by-16),
/// measured once on the bootstrap core and shared.
static TIMER_HZ: AtomicU64 = AtomicU64::new(0);

fn apic_base() -> *mut u32 {
    // SAFETY: reading IA32_APIC_BASE has no side effects.
    let base = unsafe { Msr::new(IA32_APIC_BASE_MSR).read() } & 0xFFFF_F000;
    phys_to_virt(base) as *mut u32
}

unsafe fn reg_write(offset: u32, value: u32) {
    // SAFETY: the offset is one of the architectural LAPIC registers and
    // the base is the MMIO window of this core's APIC.
    unsafe {
        core::ptr::write_volatile(apic_base().add(offset as usize / 4), value);
    }
}

unsafe fn reg_read(offset: u32) -> u32 {
    // SAFETY: as in `reg_write`.
    unsafe { core::ptr::read_volatile(apic_base().add(offset as usize / 4)) }
}

/// Enable and configure this core's local APIC.
pub fn init(core: &PerCore) {
    // SAFETY: setting the global-enable bit and programming SVR/TPR on the
    // calling core's own APIC.
    unsafe {
        let mut msr = Msr::new(IA32_APIC_BASE_MSR);
        let val = msr.read();
        msr.write(val | IA32_APIC_BASE_ENABLE);

        reg_write(LAPIC_SVR, SVR_ENABLE | trap::SPURIOUS_VECTOR as u32);
        reg_write(LAPIC_TPR, 0);
        reg_write(LAPIC_TIMER_DIV, TIMER_DIV_16);
    }

    let mut md = core.md.lock();
    md.lapic_base = (apic_base() as u64) - crate::bootvars::read().phys_offset;
    // SAFETY: plain register read on our own APIC.
    md.apic_id = unsafe { reg_read(LAPIC_ID) >> 24 };

    if TIMER_HZ.load(Ordering::Acquire) == 0 {
        let hz = calibrate_timer();
        TIMER_HZ.store(hz, Ordering::Release);
        log::info!("lapic: timer at {} Hz (div 16)", hz);
    }
    md.lapic_timer_hz = TIMER_HZ.load(Ordering::Acquire);
}

/// Signal end-of-interrupt.
pub fn eoi() {
    // SAFETY: EOI accepts any write; this core owns its APIC.
    unsafe { reg_write(LAPIC_EOI, 0) }
}

/// Arm the one-shot scheduler timer to fire in `usec` microseconds.
pub fn timer_oneshot_us(usec: u64) {
    let hz = TIMER_HZ.load(Ordering::Acquire).max(1_000_000);
    let ticks = (hz * usec / 1_000_000).max(1) as u32;
    // SAFETY: programming this core's own LVT timer.
    unsafe {
        reg_write(
            LAPIC_LVT_TIMER,
            trap::SCHED_TIMER_VECTOR as u32 | TIMER_MODE_ONESHOT,
        );
        reg_write(LAPIC_TIMER_INIT_COUNT, ticks);
    }
}

/// Measure the LAPIC timer against a 10 ms window on PIT channel 2.
fn calibrate_timer() -> u64 {
    const PIT_FREQ: u32 = 1_193_182;
    const WINDOW: u32 = PIT_FREQ / 100; // 10 ms

    let mut gate: Port<u8> = Port::new(0x61);
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut ch2: Port<u8> = Port::new(0x42);

    // SAFETY: standard i8254 channel 2 one-shot setup with the speaker
    // output disabled; ports are architectural.
    unsafe {
        let g = gate.read();
        gate.write((g & !0x02) | 0x01);
        cmd.write(0xB2); // channel 2, lo/hi byte, mode 1
        ch2.write((WINDOW & 0xFF) as u8);
        ch2.write((WINDOW >> 8) as u8);

        // Pulse the gate to start the countdown.
        let g = gate.read();
        gate.write(g & !0x01);
        gate.write(g | 0x01);

        reg_write(LAPIC_TIMER_INIT_COUNT, u32::MAX);
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        let remaining = reg_read(LAPIC_TIMER_CUR_COUNT);
        reg_write(LAPIC_TIMER_INIT_COUNT, 0);

        let ticks_per_10ms = (u32::MAX - remaining) as u64;
        ticks_per_10ms * 100
    }
}

fn wait_delivery() {
    // SAFETY: polling the delivery-status bit of our own ICR.
    unsafe {
        while reg_read(LAPIC_ICR_LOW) & ICR_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Send an INIT IPI to the processor with the given APIC id.
pub fn send_init(apic_id: u32) {
    // SAFETY: ICR write with a physical destination; part of the Intel MP
    // startup sequence.
    unsafe {
        reg_write(LAPIC_ICR_HIGH, apic_id << 24);
        reg_write(LAPIC_ICR_LOW, ICR_INIT | ICR_ASSERT);
    }
    wait_delivery();
}

/// Send a STARTUP IPI pointing at `vector << 12` in low memory.
pub fn send_sipi(apic_id: u32, vector: u8) {
    // SAFETY: as in `send_init`.
    unsafe {
        reg_write(LAPIC_ICR_HIGH, apic_id << 24);
        reg_write(LAPIC_ICR_LOW, ICR_STARTUP | ICR_ASSERT | vector as u32);
    }
    wait_delivery();
}

/// Halt every other core. Used by panic; the targets never return.
pub fn broadcast_halt() {
    // SAFETY: fixed-delivery broadcast to all-but-self with the halt
    // vector; receivers park with interrupts off.
    unsafe {
        reg_write(
            LAPIC_ICR_LOW,
            ICR_FIXED | ICR_ASSERT | ICR_ALL_BUT_SELF | trap::HALT_VECTOR as u32,
        );
    }
}
