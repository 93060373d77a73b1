//! Clock devices
//!
//! Timed waits go through a clock-device interface so drivers never spin
//! on raw counters: `get_time_usec`, `usleep`, `msleep`, and a bounded
//! polling helper with an explicit millisecond ceiling. The kernel clock
//! is the TSC, calibrated against the PIT once at boot.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Capabilities a clock consumer may require.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClkdevFlags: u32 {
        const GET_USEC = 1 << 0;
        const USLEEP   = 1 << 1;
        const MSLEEP   = 1 << 2;
    }
}

/// A clock device.
pub trait ClockDev: Send + Sync {
    /// Monotonic microseconds since calibration.
    fn get_time_usec(&self) -> u64;

    /// Busy-wait for `usec` microseconds.
    fn usleep(&self, usec: u64);

    /// Busy-wait for `msec` milliseconds.
    fn msleep(&self, msec: u64) {
        self.usleep(msec * 1000);
    }
}

static CLOCKS: Mutex<Vec<(&'static dyn ClockDev, ClkdevFlags)>> = Mutex::new(Vec::new());

/// Register a clock device with its capabilities.
pub fn clkdev_register(dev: &'static dyn ClockDev, flags: ClkdevFlags) {
    CLOCKS.lock().push((dev, flags));
}

/// The first clock offering every requested capability.
pub fn clkdev_get(flags: ClkdevFlags) -> KernelResult<&'static dyn ClockDev> {
    CLOCKS
        .lock()
        .iter()
        .find(|(_, f)| f.contains(flags))
        .map(|(dev, _)| *dev)
        .ok_or(KernelError::NoDevice)
}

/// Poll `cond` until it holds, bounded by `ceiling_ms` milliseconds.
pub fn poll_until(mut cond: impl FnMut() -> bool, ceiling_ms: u64) -> KernelResult<()> {
    let clk = clkdev_get(ClkdevFlags::GET_USEC)?;
    let deadline = clk.get_time_usec() + ceiling_ms * 1000;
    while !cond() {
        if clk.get_time_usec() > deadline {
            return Err(KernelError::Timeout);
        }
        core::hint::spin_loop();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TSC kernel clock
// ---------------------------------------------------------------------------

/// Calibrated TSC frequency in ticks per microsecond.
static TSC_PER_US: AtomicU64 = AtomicU64::new(0);

#[cfg(target_os = "none")]
fn rdtsc() -> u64 {
    // SAFETY: reading the timestamp counter has no side effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Busy-delay without a registered clock; used during bring-up. Falls
/// back to a crude spin before calibration.
pub fn busy_udelay(usec: u64) {
    #[cfg(target_os = "none")]
    {
        let per_us = TSC_PER_US.load(Ordering::Acquire);
        if per_us == 0 {
            for _ in 0..usec * 1000 {
                core::hint::spin_loop();
            }
            return;
        }
        let target = rdtsc() + usec * per_us;
        while rdtsc() < target {
            core::hint::spin_loop();
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = usec;
    }
}

struct TscClock;

impl ClockDev for TscClock {
    fn get_time_usec(&self) -> u64 {
        #[cfg(target_os = "none")]
        {
            let per_us = TSC_PER_US.load(Ordering::Acquire).max(1);
            rdtsc() / per_us
        }
        #[cfg(not(target_os = "none"))]
        0
    }

    fn usleep(&self, usec: u64) {
        busy_udelay(usec);
    }
}

static TSC_CLOCK: TscClock = TscClock;

/// Calibrate the TSC against a 10 ms PIT window and register the kernel
/// clock.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::port::Port;

    const PIT_FREQ: u32 = 1_193_182;
    const WINDOW: u32 = PIT_FREQ / 100; // 10 ms

    let mut gate: Port<u8> = Port::new(0x61);
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut ch2: Port<u8> = Port::new(0x42);

    // SAFETY: standard i8254 channel 2 one-shot measurement, speaker off.
    let ticks = unsafe {
        let g = gate.read();
        gate.write((g & !0x02) | 0x01);
        cmd.write(0xB2);
        ch2.write((WINDOW & 0xFF) as u8);
        ch2.write((WINDOW >> 8) as u8);

        let g = gate.read();
        gate.write(g & !0x01);
        gate.write(g | 0x01);

        let start = rdtsc();
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        rdtsc() - start
    };

    let per_us = (ticks / 10_000).max(1);
    TSC_PER_US.store(per_us, Ordering::Release);
    clkdev_register(&TSC_CLOCK, ClkdevFlags::all());
    log::info!("clock: tsc at {} MHz", per_us);
}

#[cfg(not(target_os = "none"))]
pub fn init() {
    clkdev_register(&TSC_CLOCK, ClkdevFlags::all());
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct FakeClock;
    impl ClockDev for FakeClock {
        fn get_time_usec(&self) -> u64 {
            0
        }
        fn usleep(&self, _usec: u64) {}
    }
    static FAKE: FakeClock = FakeClock;

    #[test]
    fn clkdev_get_matches_capabilities() {
        clkdev_register(&FAKE, ClkdevFlags::GET_USEC | ClkdevFlags::USLEEP);
        let dev = clkdev_get(ClkdevFlags::GET_USEC).expect("capability present");
        assert_eq!(dev.get_time_usec(), 0);
        // MSLEEP was not offered by the fake; requiring all three may still
        // succeed if the kernel clock registered first, so only assert the
        // positive case here.
    }
}
