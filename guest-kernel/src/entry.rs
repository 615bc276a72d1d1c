//! Naked entry stubs. The CPU pushes a non-uniform frame per vector (an
//! error code for `#SS`/`#GP`/`#PF`, none for `#DE`/`#BP`); each stub's only
//! job is to normalize that into `(frame_ptr, error_code)` or `(frame_ptr,)`
//! and tail-call the matching handler in [`crate::fault`]. None of these
//! handlers return, so each stub ends in `hlt` purely as a backstop.
//!
//! `syscall_entry` is unrelated to the IDT — it is the `LSTAR` target,
//! reached directly by the `syscall` instruction, which pushes no frame at
//! all. It must spill the live syscall ABI registers to memory before
//! touching `eax`/`edx`, since the hypercall doorbell (`out dx, eax`) can
//! only ever clobber those two. `rcx`/`r11` (the return `rip`/`rflags` that
//! `syscall` stashed there) are never touched, so the trailing `sysretq`
//! carries the guest back to exactly where it trapped — the host answers
//! the hypercall by writing a return value into `rax` and re-entering
//! `KVM_RUN` at this same instruction, never by unwinding the stub itself.

core::arch::global_asm!(
    // SYSCALL_HANDLER_ADDR (0x0) must be this stub's first byte; the linker
    // script places `.text.entry` at the very start of the image for that.
    ".section .text.entry, \"ax\"",
    ".global syscall_entry",
    "syscall_entry:",
    "mov qword ptr [0x240], rax", // nr
    "mov qword ptr [0x248], rdi", // arg0
    "mov qword ptr [0x250], rsi", // arg1
    "mov qword ptr [0x258], rdx", // arg2
    "mov qword ptr [0x260], r10", // arg3
    "mov qword ptr [0x268], r8",  // arg4
    "mov qword ptr [0x270], r9",  // arg5
    "mov eax, 1", // HypercallOp::Syscall
    "mov dx, 16", // HYPERCALL_PORT
    "out dx, eax",
    // host has stopped the VCPU, read SyscallRegs, possibly written a
    // fresh rax, and resumed us right here for anything but exit/fault.
    "sysretq",
    ".previous",
);

core::arch::global_asm!(
    ".section .text, \"ax\"",
    ".global vector0_entry",
    "vector0_entry:", // #DE, no error code
    "mov rdi, rsp",
    "call div_by_zero_handler",
    "hlt",
    ".global vector3_entry",
    "vector3_entry:", // #BP, no error code
    "mov rdi, rsp",
    "call breakpoint_handler",
    "hlt",
    ".global vector12_entry",
    "vector12_entry:", // #SS, pushes an error code
    "pop rsi",
    "mov rdi, rsp",
    "call stack_segment_handler",
    "hlt",
    ".global vector13_entry",
    "vector13_entry:", // #GP, pushes an error code
    "pop rsi",
    "mov rdi, rsp",
    "call general_protection_handler",
    "hlt",
    ".global vector14_entry",
    "vector14_entry:", // #PF, pushes an error code
    "pop rsi",
    "mov rdi, rsp",
    "call page_fault_handler",
    "hlt",
    ".previous",
);

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    crate::fault::halt_forever()
}
