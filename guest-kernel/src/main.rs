#![no_std]
#![no_main]

// Pulls the lib crate's `#[no_mangle]` handlers and `global_asm!` stubs into
// this binary's link. Nothing here is ever called from Rust — every symbol
// is reached by hardware (IDT gate, `LSTAR`) or by name from `entry.rs`'s
// raw assembly.
use guest_kernel as _;
