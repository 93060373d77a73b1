//! Process teardown
//!
//! Exit walks the range list releasing every backing region, reaps the
//! environment block through its pointer box, drops the file table, and
//! frees the address space. Killing the process currently on this core
//! marks the core idle and enters the idle loop -- execution past that
//! point is unreachable.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use super::{Pid, Process, ProcFlags};
use crate::arch::x86_64::trap::TrapFrame;
use crate::error::{KernelError, KernelResult};
use crate::mm::{self, PAGE_SIZE};

/// Wait objects: child pid to the parent parked on it. An entry is
/// claimed exactly once -- by the exiting child's wake, or by the parent
/// itself when it loses the race -- so a sleeper is never enqueued twice.
static WAITQ: Mutex<BTreeMap<Pid, Pid>> = Mutex::new(BTreeMap::new());

fn waitq_register(child: Pid, parent: Pid) {
    WAITQ.lock().insert(child, parent);
}

fn waitq_claim(child: Pid) -> Option<Pid> {
    WAITQ.lock().remove(&child)
}

/// Release everything the process owns except the address-space root.
/// Safe to run for a process that is not currently executing anywhere.
fn teardown(proc: &Arc<Process>, status: i32) {
    proc.set_flag(ProcFlags::EXITING);

    // Free every recorded range. This is the documented (runqueue,
    // maplist) teardown path; no other lock is held here.
    let vas = proc.pcb.lock().vas;
    for range in proc.take_ranges() {
        mm::vas::vm_unmap(&vas, range.virt_base, range.len);
        mm::vm_free_frame(range.phys_base, range.len / PAGE_SIZE);
    }

    // Reap the environment block and everything its box owns.
    proc.envblk_box.lock().terminate();
    *proc.envblk.lock() = None;

    // Drop file references; vnodes reclaim when their last user goes.
    {
        let mut fdtab = proc.fdtab.lock();
        for slot in fdtab.iter_mut() {
            *slot = None;
        }
    }

    proc.mark_zombie(status);

    // Wake a parent parked on our wait object by putting it back on a run
    // queue; orphans are reaped immediately.
    match proc.parent() {
        Some(_) => {
            if let Some(waiter) = waitq_claim(proc.pid()) {
                if let Some(parent) = super::lookup(waiter) {
                    parent.clear_flag(ProcFlags::SLEEPING);
                    crate::sched::enqueue(parent);
                }
            }
        }
        None => super::unregister(proc.pid()),
    }
}

/// Kill a process. For the process currently on this core the call does
/// not return: the core goes idle and the idle loop takes over.
pub fn proc_kill(proc: &Arc<Process>, status: i32) -> KernelResult<()> {
    let core = crate::arch::x86_64::percpu::this_core().ok_or(KernelError::NotConfigured)?;

    let is_current = core
        .curproc()
        .map(|cur| cur.pid() == proc.pid())
        .unwrap_or(false);

    teardown(proc, status);

    if is_current {
        core.set_curproc(None);
        die_current(proc)
    } else {
        let vas = proc.pcb.lock().vas;
        vas.free();
        Ok(())
    }
}

/// Final act of a self-terminating process: step off the dying address
/// space, release it, and idle this core. Never returns.
#[cfg(target_os = "none")]
fn die_current(proc: &Arc<Process>) -> KernelResult<()> {
    // SAFETY: the boot VAS maps the whole kernel.
    unsafe { mm::Vas::boot().load() };
    let vas = proc.pcb.lock().vas;
    vas.free();
    crate::sched::idle_loop()
}

#[cfg(not(target_os = "none"))]
fn die_current(_proc: &Arc<Process>) -> KernelResult<()> {
    unreachable!("host builds have no current process")
}

/// Fatal-trap path: terminate the current process and put the next
/// runnable one on the CPU by rewriting the live trap frame. With nothing
/// runnable the core enters the idle loop.
pub fn kill_current_and_reschedule(tf: &mut TrapFrame) {
    let Some(core) = crate::arch::x86_64::percpu::this_core() else {
        panic!("fatal user trap with no core state");
    };
    let Some(cur) = core.set_curproc(None) else {
        panic!("fatal user trap with no current process");
    };

    log::warn!("killing pid {} after fatal trap", cur.pid());
    teardown(&cur, -1);

    #[cfg(target_os = "none")]
    {
        // SAFETY: the boot VAS maps the whole kernel.
        unsafe { mm::Vas::boot().load() };
        cur.pcb.lock().vas.free();

        match crate::sched::take_runnable(core) {
            Some(next) => {
                {
                    let pcb = next.pcb.lock();
                    // SAFETY: process address spaces carry the kernel half.
                    unsafe { pcb.vas.load() };
                    *tf = pcb.tf;
                }
                core.set_curproc(Some(next));
                crate::arch::x86_64::apic::timer_oneshot_us(crate::sched::SCHED_QUANTUM_US);
            }
            None => crate::sched::idle_loop(),
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = tf;
    }
}

/// Wait for `child` to exit, then reap it and return its status.
///
/// If the child is already a zombie the reap is immediate. Otherwise the
/// caller is parked: flagged SLEEPING, entered on the child's wait
/// object, and taken off the core entirely -- its saved frame is rewound
/// so the syscall restarts when the exiting child's wake re-enqueues it,
/// and the core switches to the next runnable process in the meantime.
pub fn waitpid(parent: &Arc<Process>, child_pid: Pid, tf: &mut TrapFrame) -> KernelResult<i32> {
    let child = super::lookup(child_pid).ok_or(KernelError::NoProcess)?;
    if child.parent() != Some(parent.pid()) {
        return Err(KernelError::NoProcess);
    }

    if child.is_zombie() {
        parent.clear_flag(ProcFlags::SLEEPING);
        super::unregister(child_pid);
        return Ok(child.exit_status());
    }

    #[cfg(target_os = "none")]
    {
        park_on_child(parent, &child, tf)
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = tf;
        Err(KernelError::Again)
    }
}

/// Take the calling process off the core until `child` exits. Never
/// returns: the core resumes the next runnable process (or idles), and
/// the parked caller re-executes `waitpid` once the child's wake puts it
/// back on a run queue.
#[cfg(target_os = "none")]
fn park_on_child(parent: &Arc<Process>, child: &Arc<Process>, tf: &TrapFrame) -> ! {
    let Some(core) = crate::arch::x86_64::percpu::this_core() else {
        panic!("waitpid: no core state");
    };

    // Save a restartable frame first: when rescheduled, the caller
    // re-enters the gate and finds the child a zombie.
    {
        let mut pcb = parent.pcb.lock();
        pcb.tf = *tf;
        pcb.tf.rip -= crate::syscall::SYSCALL_INSN_LEN;
    }
    core.set_curproc(None);
    parent.set_flag(ProcFlags::SLEEPING);
    waitq_register(child.pid(), parent.pid());

    // The child may have exited between the zombie check and the wait
    // entry. Whoever claims the entry performs the one wake.
    if child.is_zombie() {
        if waitq_claim(child.pid()).is_some() {
            parent.clear_flag(ProcFlags::SLEEPING);
            crate::sched::enqueue(parent.clone());
        }
    }

    // Hand the core over.
    if let Some(next) = crate::sched::take_runnable(core) {
        core.set_curproc(Some(next.clone()));
        // SAFETY: the process was fully initialized before it was
        // enqueued.
        unsafe { crate::arch::x86_64::context::kick(&next) }
    }
    crate::sched::idle_loop()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn wait_entries_are_claimed_exactly_once() {
        waitq_register(9001, 9000);
        assert_eq!(waitq_claim(9001), Some(9000), "first claim wins");
        assert_eq!(waitq_claim(9001), None, "a wake happens once");
    }

    #[test]
    fn waitpid_rejects_strangers_and_reaps_zombies() {
        use crate::security::mac::MacLevel;

        let parent = Process::for_tests(9100);
        let stranger = Process::for_tests(9101);
        super::super::register(&stranger);
        let mut tf = TrapFrame::default();

        // Not our child: the pid exists but the parent link does not match.
        assert_eq!(
            waitpid(&parent, 9101, &mut tf).err(),
            Some(KernelError::NoProcess)
        );

        // Unknown pid.
        assert_eq!(
            waitpid(&parent, 9999, &mut tf).err(),
            Some(KernelError::NoProcess)
        );

        // A zombie child is reaped immediately, without parking.
        let child = Process::new_bare(Some(parent.pid()), MacLevel::Global);
        super::super::register(&child);
        child.mark_zombie(42);
        assert_eq!(waitpid(&parent, child.pid(), &mut tf).unwrap(), 42);
        assert!(
            super::super::lookup(child.pid()).is_none(),
            "reap removes the zombie from the table"
        );

        super::super::unregister(9101);
    }
}
