//! The guest-side half of the virtualization substrate: a page of code,
//! confined to guest address `0x0`, that the host VCPU's IDT and `LSTAR`
//! point into. It never runs any initialization of its own — the host sets
//! `RIP` straight to the target binary's entry point (spec §4.5) — it only
//! ever gets entered by hardware exception delivery or a `syscall`
//! instruction, and every path out of it is a hypercall.
#![cfg_attr(not(test), no_std)]

pub mod fault;

#[cfg(not(test))]
mod entry;
