use fault_abi::{FaultInfo, FaultKind, HypercallOp, KernelFaultInfo, FAULT_SCRATCH_ADDR, HYPERCALL_PORT};
#[cfg(test)]
use fault_abi::SyscallRegs;

/// CPU-pushed interrupt frame, normalized by the naked entry stubs in
/// [`crate::entry`]. Field order matches what the CPU actually leaves on the
/// stack for a same-privilege-level... no, a privilege-raising (ring3 -> ring0)
/// exception in long mode: `rip`, `cs`, `rflags`, `rsp` (the TSS.RSP0-backed
/// stack switch means `ss` does not need to be inspected here).
#[repr(C)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
}

const PF_PRESENT: u64 = 1 << 0;
const PF_WRITE: u64 = 1 << 1;
const PF_USER: u64 = 1 << 2;
const PF_EXECUTE: u64 = 1 << 4;

/// Decode a `#PF` error code into a `FaultInfo`, per the truth table in
/// §4.6. Pure and host-testable; the naked stub only supplies the frame and
/// error code, never the decoding logic itself.
pub fn decode_page_fault(frame: &InterruptFrame, error_code: u64, cr2: u64) -> Option<FaultInfo> {
    let user = error_code & PF_USER != 0;
    if !user {
        // A kernel-mode page fault never happens by construction (the target
        // always runs at CPL 3) and is fatal; there is nothing to forward.
        return None;
    }
    let present = error_code & PF_PRESENT != 0;
    let write = error_code & PF_WRITE != 0;
    let execute = error_code & PF_EXECUTE != 0;
    Some(FaultInfo {
        rip: frame.rip,
        fault_addr: cr2,
        kind: FaultKind::from_page_fault_bits(present, write, execute),
    })
}

pub fn breakpoint_info(frame: &InterruptFrame) -> FaultInfo {
    FaultInfo { rip: frame.rip, fault_addr: 0, kind: FaultKind::Breakpoint }
}

pub fn div_by_zero_info(frame: &InterruptFrame) -> FaultInfo {
    FaultInfo { rip: frame.rip, fault_addr: 0, kind: FaultKind::DivByZero }
}

pub fn general_protection_info(frame: &InterruptFrame, _error_code: u64) -> FaultInfo {
    FaultInfo { rip: frame.rip, fault_addr: 0, kind: FaultKind::GeneralProtection }
}

pub fn stack_segment_info(frame: &InterruptFrame, _error_code: u64) -> FaultInfo {
    FaultInfo { rip: frame.rip, fault_addr: 0, kind: FaultKind::StackSegment }
}

/// Write `info` to the fixed fault scratch address and ring the hypercall
/// doorbell. Never returns — the host clears `running` on a `Fault` tag and
/// never re-enters `KVM_RUN` against this VCPU.
#[cfg(not(test))]
pub fn emit_fault(info: FaultInfo) -> ! {
    unsafe {
        core::ptr::write_volatile(FAULT_SCRATCH_ADDR as *mut FaultInfo, info);
        let tag = HypercallOp::Fault as u32;
        core::arch::asm!(
            "out dx, eax",
            in("dx") HYPERCALL_PORT,
            in("eax") tag,
            options(nomem, nostack),
        );
    }
    halt_forever()
}

/// Same shape as `emit_fault`, for the kernel-mode page-fault case
/// `decode_page_fault` itself cannot classify. Reached only if the CPL0
/// invariant this substrate otherwise guarantees is somehow violated; the
/// host turns this into a fatal, VM-terminating error rather than letting
/// the VM hang on an unexplained `hlt` loop.
#[cfg(not(test))]
pub fn emit_kernel_fault(info: KernelFaultInfo) -> ! {
    unsafe {
        core::ptr::write_volatile(FAULT_SCRATCH_ADDR as *mut KernelFaultInfo, info);
        let tag = HypercallOp::KernelFault as u32;
        core::arch::asm!(
            "out dx, eax",
            in("dx") HYPERCALL_PORT,
            in("eax") tag,
            options(nomem, nostack),
        );
    }
    halt_forever()
}

#[cfg(not(test))]
pub fn read_cr2() -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack));
    }
    value
}

#[cfg(not(test))]
pub fn halt_forever() -> ! {
    loop {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) }
    }
}

#[cfg(not(test))]
#[unsafe(no_mangle)]
pub extern "C" fn page_fault_handler(frame: *const InterruptFrame, error_code: u64) -> ! {
    let frame = unsafe { &*frame };
    let cr2 = read_cr2();
    match decode_page_fault(frame, error_code, cr2) {
        Some(info) => emit_fault(info),
        None => emit_kernel_fault(KernelFaultInfo { rip: frame.rip, fault_addr: cr2 }),
    }
}

#[cfg(not(test))]
#[unsafe(no_mangle)]
pub extern "C" fn breakpoint_handler(frame: *const InterruptFrame) -> ! {
    emit_fault(breakpoint_info(unsafe { &*frame }))
}

#[cfg(not(test))]
#[unsafe(no_mangle)]
pub extern "C" fn div_by_zero_handler(frame: *const InterruptFrame) -> ! {
    emit_fault(div_by_zero_info(unsafe { &*frame }))
}

#[cfg(not(test))]
#[unsafe(no_mangle)]
pub extern "C" fn general_protection_handler(frame: *const InterruptFrame, error_code: u64) -> ! {
    emit_fault(general_protection_info(unsafe { &*frame }, error_code))
}

#[cfg(not(test))]
#[unsafe(no_mangle)]
pub extern "C" fn stack_segment_handler(frame: *const InterruptFrame, error_code: u64) -> ! {
    emit_fault(stack_segment_info(unsafe { &*frame }, error_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(rip: u64) -> InterruptFrame {
        InterruptFrame { rip, cs: 0x1b, rflags: 0x202, rsp: 0x7fff_ffff_f000 }
    }

    #[test]
    fn kernel_mode_page_fault_has_no_forwardable_info() {
        assert!(decode_page_fault(&frame(0x401000), 0b000, 0xdead).is_none());
    }

    #[test]
    fn user_read_of_unmapped_page_is_out_of_bounds_read() {
        let info = decode_page_fault(&frame(0x401000), PF_USER, 0).unwrap();
        assert_eq!(info.kind, FaultKind::OutOfBoundsRead);
        assert_eq!(info.fault_addr, 0);
    }

    #[test]
    fn user_write_to_present_read_only_page_is_write_fault() {
        let info = decode_page_fault(&frame(0x401000), PF_USER | PF_PRESENT | PF_WRITE, 0x402000).unwrap();
        assert_eq!(info.kind, FaultKind::Write);
        assert_eq!(info.fault_addr, 0x402000);
    }

    #[test]
    fn user_exec_of_nx_or_missing_page_is_exec_variants() {
        let nx = decode_page_fault(&frame(0x403000), PF_USER | PF_PRESENT | PF_EXECUTE, 0x404000).unwrap();
        assert_eq!(nx.kind, FaultKind::Exec);

        let missing = decode_page_fault(&frame(0x403000), PF_USER | PF_EXECUTE, 0x404000).unwrap();
        assert_eq!(missing.kind, FaultKind::OutOfBoundsExec);
    }

    #[test]
    fn breakpoint_preserves_rip_from_frame_not_return_path() {
        let info = breakpoint_info(&frame(0x555555));
        assert_eq!(info.rip, 0x555555);
        assert_eq!(info.kind, FaultKind::Breakpoint);
    }

    /// `entry.rs`'s `syscall_entry` stub spills registers to fixed,
    /// hand-computed byte offsets from `SYSCALL_SCRATCH_ADDR`; this pins the
    /// `SyscallRegs` layout those offsets assume so the two cannot silently
    /// drift apart.
    #[test]
    fn syscall_regs_field_offsets_match_entry_stub_assumptions() {
        let regs = SyscallRegs { nr: 0, arg0: 0, arg1: 0, arg2: 0, arg3: 0, arg4: 0, arg5: 0 };
        let base = &regs as *const _ as usize;
        assert_eq!(&regs.nr as *const _ as usize - base, 0);
        assert_eq!(&regs.arg0 as *const _ as usize - base, 8);
        assert_eq!(&regs.arg1 as *const _ as usize - base, 16);
        assert_eq!(&regs.arg2 as *const _ as usize - base, 24);
        assert_eq!(&regs.arg3 as *const _ as usize - base, 32);
        assert_eq!(&regs.arg4 as *const _ as usize - base, 40);
        assert_eq!(&regs.arg5 as *const _ as usize - base, 48);
    }
}
