//! Trap handling
//!
//! Every vector funnels through a uniform trap frame pushed by naked
//! assembly stubs (vectors without a hardware error code push a
//! placeholder). The high-level dispatcher routes timer ticks to the
//! scheduler, the user gate to the syscall window machinery, pool vectors
//! to registered external handlers, and everything else to the exception
//! path.

use core::arch::naked_asm;

/// User-accessible syscall gate.
pub const TRAP_SYSCALL: u64 = 0x80;
/// Inter-processor halt gate; a core that takes this never returns.
pub const HALT_VECTOR: u64 = 0x90;
/// Per-core interval timer (highest priority level).
pub const SCHED_TIMER_VECTOR: u64 = 0xF0;
/// LAPIC spurious vector.
pub const SPURIOUS_VECTOR: u64 = 0xFF;

/// First vector of the externally routed pool.
pub const POOL_FIRST: u64 = 0x60;
/// One past the last pool vector.
pub const POOL_END: u64 = 0xF0;

/// Full snapshot of processor state at trap entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub trapno: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Did this trap come in from ring 3?
    pub fn from_user(&self) -> bool {
        self.cs & 3 != 0
    }
}

/// Trap number to name, indexed by `trapno`.
const TRAP_STR: [&str; 20] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection",
    "page fault",
    "bad",
    "x87 floating point",
    "alignment check",
    "machine check",
    "simd floating point",
];

/// Page fault error-code flags, bit relative.
const PF_FLAGS: [u8; 7] = [
    b'p', // present
    b'w', // write
    b'u', // user
    b'r', // reserved write
    b'x', // instruction fetch
    b'k', // protection key violation
    b's', // shadow stack access
];

// ---------------------------------------------------------------------------
// Entry stubs
// ---------------------------------------------------------------------------

/// Common tail for every vector: save the remaining registers to complete
/// the `TrapFrame`, swap the per-CPU base when arriving from user mode,
/// call the dispatcher, and unwind.
#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // CS sits at +0x90: 15 saved registers, trapno, error code, RIP.
        "test byte ptr [rsp + 0x90], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "mov rdi, rsp",
        "call {dispatch}",
        // The dispatcher may have swapped in another context; re-check the
        // privilege level of the frame we are about to restore.
        "test byte ptr [rsp + 0x90], 3",
        "jz 3f",
        "swapgs",
        "3:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym trap_dispatch,
    );
}

/// Stub for a vector the hardware does not push an error code for.
macro_rules! trap_stub {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                concat!("push ", $vector),
                "jmp {common}",
                common = sym trap_common,
            );
        }
    };
}

/// Stub for a vector that arrives with a hardware error code on the stack.
macro_rules! trap_stub_err {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                concat!("push ", $vector),
                "jmp {common}",
                common = sym trap_common,
            );
        }
    };
}

trap_stub!(trap_divide_error, 0);
trap_stub!(trap_debug, 1);
trap_stub!(trap_nmi, 2);
trap_stub!(trap_breakpoint, 3);
trap_stub!(trap_overflow, 4);
trap_stub!(trap_bound_range, 5);
trap_stub!(trap_invalid_opcode, 6);
trap_stub!(trap_device_na, 7);
trap_stub_err!(trap_double_fault, 8);
trap_stub_err!(trap_invalid_tss, 10);
trap_stub_err!(trap_segment_np, 11);
trap_stub_err!(trap_stack_segment, 12);
trap_stub_err!(trap_general_protection, 13);
trap_stub_err!(trap_page_fault, 14);
trap_stub!(trap_x87, 16);
trap_stub_err!(trap_alignment_check, 17);
trap_stub!(trap_machine_check, 18);
trap_stub!(trap_simd, 19);

trap_stub!(trap_syscall_gate, 0x80);
trap_stub!(trap_halt_ipi, 0x90);
trap_stub!(trap_sched_timer, 0xF0);
trap_stub!(trap_spurious, 0xFF);

/// Stubs for the externally routed pool. Each vector needs its own entry
/// so the handler record can be found again; const generics cannot name
/// functions, so the pool is enumerated.
macro_rules! pool_stubs {
    ($($name:ident = $vec:literal),* $(,)?) => {
        $( trap_stub!($name, $vec); )*
        /// (vector, stub) pairs for the registration pool.
        pub(super) const POOL_STUBS: &[(u8, unsafe extern "C" fn())] = &[
            $( ($vec, $name) ),*
        ];
    };
}

pool_stubs! {
    vec_0x60 = 0x60, vec_0x61 = 0x61, vec_0x62 = 0x62, vec_0x63 = 0x63,
    vec_0x64 = 0x64, vec_0x65 = 0x65, vec_0x66 = 0x66, vec_0x67 = 0x67,
    vec_0x68 = 0x68, vec_0x69 = 0x69, vec_0x6a = 0x6A, vec_0x6b = 0x6B,
    vec_0x6c = 0x6C, vec_0x6d = 0x6D, vec_0x6e = 0x6E, vec_0x6f = 0x6F,
    vec_0x70 = 0x70, vec_0x71 = 0x71, vec_0x72 = 0x72, vec_0x73 = 0x73,
    vec_0x74 = 0x74, vec_0x75 = 0x75, vec_0x76 = 0x76, vec_0x77 = 0x77,
    vec_0x78 = 0x78, vec_0x79 = 0x79, vec_0x7a = 0x7A, vec_0x7b = 0x7B,
    vec_0x7c = 0x7C, vec_0x7d = 0x7D, vec_0x7e = 0x7E, vec_0x7f = 0x7F,
    vec_0x81 = 0x81, vec_0x82 = 0x82, vec_0x83 = 0x83, vec_0x84 = 0x84,
    vec_0x85 = 0x85, vec_0x86 = 0x86, vec_0x87 = 0x87, vec_0x88 = 0x88,
    vec_0x89 = 0x89, vec_0x8a = 0x8A, vec_0x8b = 0x8B, vec_0x8c = 0x8C,
    vec_0x8d = 0x8D, vec_0x8e = 0x8E, vec_0x8f = 0x8F,
    vec_0x91 = 0x91, vec_0x92 = 0x92, vec_0x93 = 0x93, vec_0x94 = 0x94,
    vec_0x95 = 0x95, vec_0x96 = 0x96, vec_0x97 = 0x97, vec_0x98 = 0x98,
    vec_0x99 = 0x99, vec_0x9a = 0x9A, vec_0x9b = 0x9B, vec_0x9c = 0x9C,
    vec_0x9d = 0x9D, vec_0x9e = 0x9E, vec_0x9f = 0x9F,
    vec_0xa0 = 0xA0, vec_0xa1 = 0xA1, vec_0xa2 = 0xA2, vec_0xa3 = 0xA3,
    vec_0xa4 = 0xA4, vec_0xa5 = 0xA5, vec_0xa6 = 0xA6, vec_0xa7 = 0xA7,
    vec_0xa8 = 0xA8, vec_0xa9 = 0xA9, vec_0xaa = 0xAA, vec_0xab = 0xAB,
    vec_0xac = 0xAC, vec_0xad = 0xAD, vec_0xae = 0xAE, vec_0xaf = 0xAF,
    vec_0xb0 = 0xB0, vec_0xb1 = 0xB1, vec_0xb2 = 0xB2, vec_0xb3 = 0xB3,
    vec_0xb4 = 0xB4, vec_0xb5 = 0xB5, vec_0xb6 = 0xB6, vec_0xb7 = 0xB7,
    vec_0xb8 = 0xB8, vec_0xb9 = 0xB9, vec_0xba = 0xBA, vec_0xbb = 0xBB,
    vec_0xbc = 0xBC, vec_0xbd = 0xBD, vec_0xbe = 0xBE, vec_0xbf = 0xBF,
    vec_0xc0 = 0xC0, vec_0xc1 = 0xC1, vec_0xc2 = 0xC2, vec_0xc3 = 0xC3,
    vec_0xc4 = 0xC4, vec_0xc5 = 0xC5, vec_0xc6 = 0xC6, vec_0xc7 = 0xC7,
    vec_0xc8 = 0xC8, vec_0xc9 = 0xC9, vec_0xca = 0xCA, vec_0xcb = 0xCB,
    vec_0xcc = 0xCC, vec_0xcd = 0xCD, vec_0xce = 0xCE, vec_0xcf = 0xCF,
    vec_0xd0 = 0xD0, vec_0xd1 = 0xD1, vec_0xd2 = 0xD2, vec_0xd3 = 0xD3,
    vec_0xd4 = 0xD4, vec_0xd5 = 0xD5, vec_0xd6 = 0xD6, vec_0xd7 = 0xD7,
    vec_0xd8 = 0xD8, vec_0xd9 = 0xD9, vec_0xda = 0xDA, vec_0xdb = 0xDB,
    vec_0xdc = 0xDC, vec_0xdd = 0xDD, vec_0xde = 0xDE, vec_0xdf = 0xDF,
    vec_0xe0 = 0xE0, vec_0xe1 = 0xE1, vec_0xe2 = 0xE2, vec_0xe3 = 0xE3,
    vec_0xe4 = 0xE4, vec_0xe5 = 0xE5, vec_0xe6 = 0xE6, vec_0xe7 = 0xE7,
    vec_0xe8 = 0xE8, vec_0xe9 = 0xE9, vec_0xea = 0xEA, vec_0xeb = 0xEB,
    vec_0xec = 0xEC, vec_0xed = 0xED, vec_0xee = 0xEE, vec_0xef = 0xEF,
}

// ---------------------------------------------------------------------------
// High-level dispatch
// ---------------------------------------------------------------------------

extern "C" fn trap_dispatch(tf: &mut TrapFrame) {
    match tf.trapno {
        TRAP_SYSCALL => crate::syscall::dispatch(tf),
        SCHED_TIMER_VECTOR => crate::sched::preempt(tf),
        HALT_VECTOR => halt_forever(),
        SPURIOUS_VECTOR => super::apic::eoi(),
        v if (POOL_FIRST..POOL_END).contains(&v) => {
            crate::irq::dispatch(v as u8);
            super::apic::eoi();
        }
        _ => exception(tf),
    }
}

/// Read the page-fault address register.
fn pf_faultaddr() -> u64 {
    let cr2: u64;
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
    }
    cr2
}

/// Log the decoded page-fault error code as a `[pwurxks]` flag string.
fn pf_code(error_code: u64) {
    let mut tab = [b'-'; 7];
    for (i, flag) in PF_FLAGS.iter().enumerate() {
        if error_code & (1 << i) != 0 {
            tab[i] = *flag;
        }
    }
    crate::println!("code=[{}]", core::str::from_utf8(&tab).unwrap_or("???"));
}

/// Dump processor state for a trap frame.
fn trapframe_dump(tf: &TrapFrame) {
    let cr2 = pf_faultaddr();
    let cr3 = {
        use x86_64::registers::control::Cr3;
        Cr3::read().0.start_address().as_u64()
    };

    let name = TRAP_STR
        .get(tf.trapno as usize)
        .copied()
        .unwrap_or("unknown");

    if tf.trapno == 14 {
        pf_code(tf.error_code);
    }

    crate::println!(
        "got trap ({})\n\n\
         -- DUMPING PROCESSOR STATE --\n\
         RAX={:#018x} RCX={:#018x} RDX={:#018x}\n\
         RBX={:#018x} RSI={:#018x} RDI={:#018x}\n\
         RFL={:#018x} CR2={:#018x} CR3={:#018x}\n\
         RBP={:#018x} RSP={:#018x} RIP={:#018x}\n",
        name,
        tf.rax,
        tf.rcx,
        tf.rdx,
        tf.rbx,
        tf.rsi,
        tf.rdi,
        tf.rflags,
        cr2,
        cr3,
        tf.rbp,
        tf.rsp,
        tf.rip
    );
}

fn exception(tf: &mut TrapFrame) {
    // Breakpoints just report and continue.
    if tf.trapno == 3 {
        crate::println!("breakpoint at {:#x}", tf.rip);
        return;
    }

    trapframe_dump(tf);

    if tf.from_user() {
        // Fatal trap in user mode: kill the process and hand the core to
        // the next runnable one.
        crate::process::kill_current_and_reschedule(tf);
        return;
    }

    panic!("fatal trap in kernel mode");
}

/// Park this core forever with interrupts off. The halt IPI lands here.
pub fn halt_forever() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
