//! Process creation
//!
//! `proc_init` builds the minimal machine state: a fresh address space, a
//! user stack at the fixed top-of-user address, and a seeded trap frame so
//! a future return-to-user lands on the right selectors and stack. `spawn`
//! layers program loading, standard streams and the argument block on top
//! and hands the result to the scheduler.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{EnvBlk, Pid, Process, ARGV_BASE, STACK_LEN, STACK_TOP};
use crate::arch::x86_64::gdt::{USER_CS, USER_DS};
use crate::error::{KernelError, KernelResult};
use crate::mm::{self, MapSpec, Protection, Vas, PAGE_SIZE};

/// Initial RFLAGS for user entry: IF set plus the always-one bit.
const USER_RFLAGS: u64 = 0x202;

/// Initialize a process into a basic minimal state: fresh VAS, mapped user
/// stack, seeded trap frame. The instruction pointer is set separately by
/// the loader.
pub fn proc_init(parent: Option<&Arc<Process>>) -> KernelResult<Arc<Process>> {
    let level = parent.map(|p| p.level()).unwrap_or_default();
    let proc = Process::new_bare(parent.map(|p| p.pid()), level);

    // The platform latch is inherited from the parent.
    if let Some(parent) = parent {
        proc.scdom.set_platch_raw(parent.scdom.platch());
    }

    let vas = Vas::new()?;
    {
        let mut pcb = proc.pcb.lock();
        pcb.vas = vas;
        pcb.tf.cs = USER_CS as u64;
        pcb.tf.ss = USER_DS as u64;
        pcb.tf.rflags = USER_RFLAGS;
        pcb.tf.rsp = STACK_TOP;
    }

    // Map the user stack; a zero physical address asks the mapper to
    // allocate backing frames.
    let mut spec = MapSpec::new(STACK_TOP, 0);
    mm::vas::vm_map_for(
        &vas,
        &mut spec,
        STACK_LEN,
        Protection::READ | Protection::WRITE | Protection::USER,
        Some(&proc),
    )?;

    super::register(&proc);
    Ok(proc)
}

/// Set the instruction pointer of a process's saved frame.
pub fn set_ip(proc: &Arc<Process>, ip: u64) {
    proc.pcb.lock().tf.rip = ip;
}

/// Read a whole file out of the VFS.
fn slurp(path: &str) -> KernelResult<Vec<u8>> {
    let vp = crate::fs::namei::namei(path, crate::fs::namei::NameiFlags::empty())?;
    let size = vp.getattr()?.size;
    let mut data = alloc::vec![0u8; size];
    let got = vp.read(&mut data, 0)?;
    data.truncate(got);
    Ok(data)
}

/// Lay the argument block out in the child's address space: a
/// NULL-terminated pointer array followed by the string bytes, in one
/// user-readable mapping below the stack.
fn build_argv(proc: &Arc<Process>, vas: &Vas, argv: &[String]) -> KernelResult<()> {
    if argv.is_empty() {
        return Ok(());
    }

    let ptrs_len = (argv.len() + 1) * core::mem::size_of::<u64>();
    let strings_len: usize = argv.iter().map(|a| a.len() + 1).sum();
    let total = ptrs_len + strings_len;
    if total > PAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }

    let mut spec = MapSpec::new(ARGV_BASE, 0);
    mm::vas::vm_map_for(
        vas,
        &mut spec,
        total,
        Protection::READ | Protection::USER,
        Some(proc),
    )?;

    // The mapping is backed by frames we just allocated; fill it through
    // the physical window since the child's address space is not active.
    // SAFETY: `spec.phys` addresses at least `total` bytes of freshly
    // allocated frames.
    let window =
        unsafe { core::slice::from_raw_parts_mut(mm::phys_to_virt(spec.phys), PAGE_SIZE) };

    let mut user_ptrs = Vec::with_capacity(argv.len());
    let mut str_off = ptrs_len;
    for (i, arg) in argv.iter().enumerate() {
        let user_va = ARGV_BASE + str_off as u64;
        window[str_off..str_off + arg.len()].copy_from_slice(arg.as_bytes());
        window[str_off + arg.len()] = 0;
        window[i * 8..i * 8 + 8].copy_from_slice(&user_va.to_le_bytes());
        user_ptrs.push(user_va);
        str_off += arg.len() + 1;
    }
    window[argv.len() * 8..argv.len() * 8 + 8].copy_from_slice(&0u64.to_le_bytes());

    *proc.envblk.lock() = Some(EnvBlk {
        argv_ptr: ARGV_BASE,
        argv: user_ptrs,
        argc: argv.len() as u16,
    });
    Ok(())
}

/// Spawn a process from a binary in the VFS. Returns the child PID; the
/// child is runnable once this returns.
pub fn spawn(path: &str, argv: &[String]) -> KernelResult<Pid> {
    let parent = super::current();
    let proc = proc_init(parent.as_ref())?;

    let image = slurp(path)?;
    let entry = crate::elf::load(&image, &proc)?;

    crate::fs::file::fdtab_init(&proc)?;

    let vas = proc.pcb.lock().vas;
    build_argv(&proc, &vas, argv)?;

    set_ip(&proc, entry);
    crate::sched::enqueue(proc.clone());
    Ok(proc.pid())
}
