//! Freestanding target that reads through a null pointer, exercising the
//! privileged-page-fault row of the page-fault truth table in spec.md §4.6
//! (guest virtual address 0 is the supervisor-only `LSTAR` target, not a
//! hole — see `tests/integration.rs::null_read_reports_privileged_page_fault`).
#![no_std]
#![no_main]

core::arch::global_asm!(
    ".section .text, \"ax\"",
    ".global _start",
    "_start:",
    "mov rax, [0]",
    "mov rax, 60", // unreachable: the read above faults first
    "xor rdi, rdi",
    "syscall",
    ".previous",
);

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
