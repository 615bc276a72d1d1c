//! Host-side dispatch on a VM exit caused by a write to the hypercall
//! doorbell port (spec §4.6, §6). The only exit the host interprets as a
//! hypercall is `IoOut` on port [`fault_abi::HYPERCALL_PORT`]; everything
//! this module does runs synchronously inside [`crate::vcpu::Vcpu::run`].

use fault_abi::{FaultInfo, HypercallOp, KernelFaultInfo, SyscallRegs, FAULT_SCRATCH_ADDR, SYSCALL_SCRATCH_ADDR};
use kvm_ioctls::VcpuFd;
use log::{info, trace, warn};

use crate::error::{Error, Result};
use crate::mmu::Mmu;

const SYS_WRITE: u64 = 1;
const SYS_EXIT: u64 = 60;
const SYS_EXIT_GROUP: u64 = 231;
const ENOSYS: i64 = -38;
const EBADF: i64 = -9;

/// The "crash sink" / "coverage sink" external collaborators of spec §6
/// bind against this trait; the core never decides what a fault or a
/// syscall outcome *means* to the surrounding fuzzer, only that one
/// occurred.
pub trait HypercallSink {
    fn on_fault(&mut self, fault: FaultInfo);
    /// Returns the value to place in `rax` before resuming the guest, or
    /// `None` to answer with `-ENOSYS`. Never called for `SYS_WRITE`,
    /// `SYS_EXIT` or `SYS_EXIT_GROUP`, which the core itself understands.
    fn on_syscall(&mut self, regs: SyscallRegs) -> Option<i64>;
    fn on_exit(&mut self, status: i32);
}

/// Reads the tag word out of the `IoOut` payload, acts on it, and reports
/// whether the run loop should re-enter `KVM_RUN` (`true`) or stop
/// (`false`). A `Fault` or `Terminate` tag — or `SYS_EXIT`/`SYS_EXIT_GROUP`
/// seen through a `Syscall` tag — always stops it; a resumable `Syscall`
/// writes a return value into `rax` first so the guest's `sysretq`
/// continues with the right result. `KernelFault` is fatal: it returns
/// `Err`, tearing down the whole VM rather than just stopping the loop.
pub fn dispatch(vcpu: &mut VcpuFd, mmu: &mut Mmu, io_data: &[u8], sink: &mut dyn HypercallSink) -> Result<bool> {
    let mut tag_bytes = [0u8; 4];
    let n = io_data.len().min(4);
    tag_bytes[..n].copy_from_slice(&io_data[..n]);
    let tag = u32::from_le_bytes(tag_bytes);

    match HypercallOp::from_u32(tag) {
        Some(HypercallOp::Fault) => {
            let info: FaultInfo = mmu.read(FAULT_SCRATCH_ADDR)?;
            trace!("fault hypercall: {info:?}");
            sink.on_fault(info);
            Ok(false)
        }
        Some(HypercallOp::Syscall) => {
            let regs: SyscallRegs = mmu.read(SYSCALL_SCRATCH_ADDR)?;
            handle_syscall(vcpu, mmu, regs, sink)
        }
        Some(HypercallOp::Terminate) => {
            let regs = vcpu.get_regs()?;
            let status = regs.rdi as i32;
            info!("terminate hypercall: status={status}");
            sink.on_exit(status);
            Ok(false)
        }
        Some(HypercallOp::KernelFault) => {
            let info: KernelFaultInfo = mmu.read(FAULT_SCRATCH_ADDR)?;
            Err(Error::KernelModeFault { rip: info.rip, addr: info.fault_addr })
        }
        None => Err(Error::UnrecognizedHypercall(tag)),
    }
}

fn handle_syscall(vcpu: &mut VcpuFd, mmu: &mut Mmu, regs: SyscallRegs, sink: &mut dyn HypercallSink) -> Result<bool> {
    match regs.nr {
        SYS_WRITE => {
            let retval = do_write(mmu, regs.arg0, regs.arg1, regs.arg2)?;
            resume_with(vcpu, retval)
        }
        SYS_EXIT | SYS_EXIT_GROUP => {
            info!("exit syscall: status={}", regs.arg0 as i32);
            sink.on_exit(regs.arg0 as i32);
            Ok(false)
        }
        _ => {
            let retval = sink.on_syscall(regs).unwrap_or_else(|| {
                warn!("unhandled syscall nr={}", regs.nr);
                ENOSYS
            });
            resume_with(vcpu, retval)
        }
    }
}

/// The only syscall the core executes end-to-end (spec §8's hello-world
/// scenario): copies the guest buffer out and writes it to the matching
/// host fd.
fn do_write(mmu: &mut Mmu, fd: u64, buf_vaddr: u64, len: u64) -> Result<i64> {
    use std::io::Write;

    if fd != 1 && fd != 2 {
        return Ok(EBADF);
    }
    let mut buf = vec![0u8; len as usize];
    mmu.read_mem(&mut buf, buf_vaddr)?;
    let mut handle: Box<dyn Write> = if fd == 1 { Box::new(std::io::stdout()) } else { Box::new(std::io::stderr()) };
    if handle.write_all(&buf).is_err() {
        return Ok(-5); // EIO
    }
    let _ = handle.flush();
    Ok(len as i64)
}

fn resume_with(vcpu: &mut VcpuFd, retval: i64) -> Result<bool> {
    let mut regs = vcpu.get_regs()?;
    regs.rax = retval as u64;
    vcpu.set_regs(&regs)?;
    Ok(true)
}
