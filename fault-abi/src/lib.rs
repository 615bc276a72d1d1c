//! Wire types shared byte-for-byte between the guest kernel stub and the
//! host hypercall dispatcher. No dependencies, no allocation, `#![no_std]`
//! unconditionally: both sides bring their own standard library (or none).

#![no_std]

/// Guest-physical/guest-virtual address of the root of the 4-level page
/// table (spec §3, §4.2). Both the host MMU and the guest kernel stub's
/// linker script must agree that this page is off-limits to everything else.
pub const PAGE_TABLE_PADDR: u64 = 0x1000;

/// Guest-physical/guest-virtual address of the in-guest syscall entry stub
/// (spec §4.4's `LSTAR` value, §4.6's "virtual address 0"). The guest kernel
/// stub crate is linked so its `syscall_entry` symbol lands exactly here.
pub const SYSCALL_HANDLER_ADDR: u64 = 0x0;

/// Half-open interval of guest-virtual addresses the MMU is willing to map
/// with the `User` bit set (spec §3 "user range", Glossary).
pub const USER_ADDRESS_LIMIT: u64 = 0x0000_8000_0000_0000;

/// Fixed guest-physical scratch address the page-fault and other exception
/// stubs write their [`FaultInfo`] to before ringing the doorbell. Chosen
/// inside the guest kernel stub's own page, clear of the `0x0` syscall entry
/// and the code the stubs themselves occupy.
pub const FAULT_SCRATCH_ADDR: u64 = 0x200;

/// Fixed guest-physical scratch address the syscall entry stub spills the
/// live syscall ABI register file to, before clobbering `eax`/`edx` to ring
/// the doorbell (the `out` instruction only ever reads from `al`/`ax`/`eax`
/// and the port from `dx`, so both must be saved first).
pub const SYSCALL_SCRATCH_ADDR: u64 = 0x240;

/// The I/O port the sole hypercall doorbell is wired to (spec §4.4, §6).
pub const HYPERCALL_PORT: u16 = 16;

/// The tag word a guest `OUT dx, eax` hypercall carries in `eax`. Arguments
/// never ride along in clobbered registers; each op has its own known
/// scratch address the host reads via `Mmu::read`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallOp {
    /// A `FaultInfo` is waiting at [`FAULT_SCRATCH_ADDR`].
    Fault = 0,
    /// A `SyscallRegs` is waiting at [`SYSCALL_SCRATCH_ADDR`].
    Syscall = 1,
    /// `edi` holds an `i32` process exit status; the guest is done.
    Terminate = 2,
    /// A `KernelFaultInfo` is waiting at [`FAULT_SCRATCH_ADDR`]: a CPL0 page
    /// fault, architecturally impossible by construction (the target always
    /// runs at CPL3) but reported rather than silently hung on.
    KernelFault = 3,
}

impl HypercallOp {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(HypercallOp::Fault),
            1 => Some(HypercallOp::Syscall),
            2 => Some(HypercallOp::Terminate),
            3 => Some(HypercallOp::KernelFault),
            _ => None,
        }
    }
}

/// Snapshot of the Linux/x86-64 syscall ABI register file, spilled by the
/// guest syscall entry stub before it clobbers `eax`/`edx` to ring the
/// doorbell. Field order matches the calling convention, not memory layout
/// significance — there is no requirement these be contiguous with anything
/// else in guest memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRegs {
    pub nr: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
}

/// Mirrors spec §3/§4.6's `FaultInfo`. `#[repr(C)]` so the guest stub's raw
/// memory writes and the host's `Mmu::read::<FaultInfo>` agree on layout
/// without either side hand-decoding the other.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub rip: u64,
    pub fault_addr: u64,
    pub kind: FaultKind,
}

/// A kernel-mode (`U=0`) page fault's minimal report — just enough to name
/// where it happened, since `FaultKind`'s `{P,W,X}` decoding exists only for
/// the user-mode scenarios of §4.6's table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelFaultInfo {
    pub rip: u64,
    pub fault_addr: u64,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read = 0,
    Write = 1,
    Exec = 2,
    OutOfBoundsRead = 3,
    OutOfBoundsWrite = 4,
    OutOfBoundsExec = 5,
    DivByZero = 6,
    GeneralProtection = 7,
    StackSegment = 8,
    Breakpoint = 9,
}

impl FaultKind {
    /// Decode a `#PF` error code's `{P, W, U, X}` bits (bits 0, 1, 2, 4) per
    /// the table in §4.6. `user` must already be known true — a kernel-mode
    /// page fault (`U=0`) is fatal and never reaches this encoding.
    pub const fn from_page_fault_bits(present: bool, write: bool, exec: bool) -> Self {
        match (present, exec, write) {
            (true, true, _) => FaultKind::Exec,
            (true, false, true) => FaultKind::Write,
            (true, false, false) => FaultKind::Read,
            (false, true, _) => FaultKind::OutOfBoundsExec,
            (false, false, true) => FaultKind::OutOfBoundsWrite,
            (false, false, false) => FaultKind::OutOfBoundsRead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_truth_table_matches_spec() {
        assert_eq!(FaultKind::from_page_fault_bits(true, false, false), FaultKind::Read);
        assert_eq!(FaultKind::from_page_fault_bits(true, false, true), FaultKind::Write);
        assert_eq!(FaultKind::from_page_fault_bits(true, true, false), FaultKind::Exec);
        assert_eq!(FaultKind::from_page_fault_bits(true, true, true), FaultKind::Exec);
        assert_eq!(FaultKind::from_page_fault_bits(false, false, false), FaultKind::OutOfBoundsRead);
        assert_eq!(FaultKind::from_page_fault_bits(false, false, true), FaultKind::OutOfBoundsWrite);
        assert_eq!(FaultKind::from_page_fault_bits(false, true, false), FaultKind::OutOfBoundsExec);
    }

    #[test]
    fn hypercall_op_round_trips_through_u32() {
        for op in [HypercallOp::Fault, HypercallOp::Syscall, HypercallOp::Terminate, HypercallOp::KernelFault] {
            assert_eq!(HypercallOp::from_u32(op as u32), Some(op));
        }
        assert_eq!(HypercallOp::from_u32(99), None);
    }

    #[test]
    fn fault_info_is_plain_old_data() {
        let a = FaultInfo { rip: 0x1000, fault_addr: 0, kind: FaultKind::Breakpoint };
        let b = a;
        assert_eq!(a, b);
        // Two u64 fields plus a u32-repr enum, padded to the struct's
        // 8-byte alignment.
        assert_eq!(core::mem::size_of::<FaultInfo>(), 24);
    }

    #[test]
    fn syscall_regs_is_seven_words() {
        assert_eq!(core::mem::size_of::<SyscallRegs>(), 56);
    }

    #[test]
    fn scratch_addresses_do_not_overlap() {
        assert!(FAULT_SCRATCH_ADDR + 20 <= SYSCALL_SCRATCH_ADDR);
        assert!(SYSCALL_SCRATCH_ADDR + 56 < PAGE_TABLE_PADDR);
    }
}
