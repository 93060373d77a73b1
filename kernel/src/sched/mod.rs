//! Scheduler core
//!
//! Per-core FIFO run queues driven by the local interval timer. The kernel
//! itself is never preempted: a tick that lands while a core is in kernel
//! context just rearms the quantum, so switches only happen at the
//! ready-to-return boundary.

pub mod arbiter;
pub mod queue;

use alloc::sync::Arc;

use crate::arch::x86_64::trap::TrapFrame;
use crate::arch::x86_64::{apic, percpu};
use crate::process::Process;

/// Scheduling quantum, in microseconds.
pub const SCHED_QUANTUM_US: u64 = 3000;

/// Idle-loop wakeup interval, in microseconds.
pub const IDLE_WAKE_US: u64 = 9000;

/// One-time scheduler announcement; the per-core queues themselves are
/// created with the core descriptors.
pub fn init() {
    if percpu::this_core().is_none() {
        panic!("sched_init: could not get core");
    }
    log::info!("sched: scheduler is [up]");
}

/// Hand a runnable process to the core chosen by the arbiter.
pub fn enqueue(proc: Arc<Process>) {
    match arbiter::pick() {
        Some(core) => core.runq.enqueue(proc),
        None => panic!("sched: no cores registered"),
    }
}

/// Dequeue the next process that is still runnable, discarding entries
/// that were killed while queued.
pub fn take_runnable(core: &percpu::PerCore) -> Option<Arc<Process>> {
    while let Some(proc) = core.runq.dequeue() {
        if proc.flags().contains(crate::process::ProcFlags::EXITING) {
            continue;
        }
        return Some(proc);
    }
    None
}

/// Quantum tick. Saves the interrupted frame into the current process,
/// requeues it, and resumes the next runnable process; with nothing else
/// runnable the current process just continues.
pub fn preempt(tf: &mut TrapFrame) {
    let Some(core) = percpu::this_core() else {
        apic::eoi();
        apic::timer_oneshot_us(SCHED_QUANTUM_US);
        return;
    };

    // Kernel context is not preemptible; take the next quantum boundary.
    if !tf.from_user() {
        apic::eoi();
        apic::timer_oneshot_us(SCHED_QUANTUM_US);
        return;
    }

    if let Some(cur) = core.curproc() {
        cur.pcb.lock().tf = *tf;
        core.runq.enqueue(cur);
    }

    match take_runnable(core) {
        Some(next) => {
            {
                let pcb = next.pcb.lock();
                // SAFETY: every process VAS carries the shared kernel half.
                #[cfg(target_os = "none")]
                unsafe {
                    pcb.vas.load()
                };
                *tf = pcb.tf;
            }
            core.set_curproc(Some(next));
            apic::eoi();
            apic::timer_oneshot_us(SCHED_QUANTUM_US);
        }
        None => {
            // Nothing runnable anywhere on this core.
            core.set_curproc(None);
            apic::eoi();
            #[cfg(target_os = "none")]
            idle_loop();
        }
    }
}

/// Idle: wait for work with the timer armed, kicking the first process
/// that shows up on this core's queue. Never returns.
#[cfg(target_os = "none")]
pub fn idle_loop() -> ! {
    let Some(core) = percpu::this_core() else {
        crate::arch::x86_64::trap::halt_forever();
    };

    loop {
        apic::timer_oneshot_us(IDLE_WAKE_US);
        if let Some(next) = take_runnable(core) {
            core.set_curproc(Some(next.clone()));
            // SAFETY: the process was fully initialized before it was
            // enqueued.
            unsafe { crate::arch::x86_64::context::kick(&next) };
        }
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}
