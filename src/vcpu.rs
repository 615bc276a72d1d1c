//! VCPU lifecycle: long-mode bring-up, run loop, exit dispatch (spec §4.4).

use kvm_bindings::{kvm_regs, kvm_sregs, Msrs, kvm_msr_entry};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::gdt::{self, USER_CODE_SEL, USER_DATA_SEL};
use crate::hypercall::HypercallSink;
use crate::mmu::Mmu;

const CR0_PE: u64 = 1 << 0;
const CR0_MP: u64 = 1 << 1;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_WP: u64 = 1 << 16;
const CR0_AM: u64 = 1 << 18;
const CR0_PG: u64 = 1 << 31;

const CR4_PAE: u64 = 1 << 5;
const CR4_OSFXSR: u64 = 1 << 9;
const CR4_OSXMMEXCPT: u64 = 1 << 10;

const EFER_SCE: u64 = 1 << 0;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// Guest physical address KVM reserves for its own (VMX-internal) identity
/// map / TSS bookkeeping — unrelated to the architectural TSS this crate
/// builds in `gdt.rs`; both coexist (spec §4.4).
const KVM_TSS_ADDR: usize = 0xfffbd000;

const MSR_STAR: u32 = 0xC000_0081;
const MSR_LSTAR: u32 = 0xC000_0082;
const MSR_SYSCALL_MASK: u32 = 0xC000_0084;

/// `SYSCALL_MASK` kept verbatim from the source (spec §9 open question,
/// resolved): it only clears `DF|IF|AC|TF|...` on entry and has no
/// dependency on the GDT layout. `SYSCALL_MASK` clears `DF|IF|AC|TF|...` on
/// entry.
const SYSCALL_MASK_VALUE: u64 = 0x003f_7fd5;

/// `STAR`, *not* kept verbatim (spec §9 open question, resolved the other
/// way): the source's constant assumes a GDT layout this crate does not
/// have — the TSS descriptor `build_gdt` needs for the IDT's stack switch
/// pushes the ring-3 SYSRET pair past where the source's 3-segment table put
/// them. Recomputed from this crate's actual selectors instead: on
/// `SYSCALL`, `CS = STAR[47:32]` (forced CPL0) and `SS = STAR[47:32] + 8`,
/// satisfied directly by [`USER_CODE_SEL`]/[`USER_DATA_SEL`]'s existing
/// code-then-data order (`0x08`/`0x10`) even though they are DPL3
/// descriptors — `SYSCALL` never consults a descriptor's own DPL. On
/// `SYSRET`, `SS = STAR[63:48] + 8` and `CS = (STAR[63:48] + 16) | 3`, which
/// needs a *data-then-code* pair instead; `gdt.rs` appends
/// `SYSRET_DATA_SEL`/`SYSRET_CODE_SEL` (`0x30`/`0x38`) for exactly this, so
/// `STAR[63:48] = 0x28`.
const STAR_VALUE: u64 = 0x0028_0008_0000_0000;

fn set_flat_user_data_segment(seg: &mut kvm_bindings::kvm_segment) {
    seg.selector = USER_DATA_SEL;
    seg.base = 0;
    seg.limit = 0xFFFFFFFF;
    seg.s = 1;
    seg.type_ = 0x3; // read/write, accessed
    seg.present = 1;
    seg.dpl = 3;
    seg.g = 1;
}

pub struct Vcpu {
    fd: VcpuFd,
    running: bool,
}

impl Vcpu {
    pub fn new(vm: &VmFd, id: u64) -> Result<Self> {
        vm.set_tss_address(KVM_TSS_ADDR)?;
        Ok(Self { fd: vm.create_vcpu(id)?, running: true })
    }

    /// Long-mode bring-up: control registers, segments, MSRs, CPUID (spec
    /// §4.4). `kernel_vectors` is `(exception vector, handler guest vaddr)`
    /// pairs sourced from the guest kernel stub ELF's symbol table.
    pub fn bring_up(&mut self, kvm: &kvm_ioctls::Kvm, mmu: &mut Mmu, kernel_vectors: &[(u8, u64)]) -> Result<()> {
        let (gdt_base, gdt_limit, tr_sel) = gdt::build_gdt(mmu)?;
        let idt_base = gdt::build_idt(mmu, kernel_vectors)?;

        let mut sregs = self.fd.get_sregs()?;

        sregs.cr3 = fault_abi::PAGE_TABLE_PADDR;
        sregs.cr4 |= CR4_PAE | CR4_OSXMMEXCPT | CR4_OSFXSR;
        sregs.cr0 |= CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG;
        sregs.efer |= EFER_LME | EFER_LMA | EFER_SCE;

        // Guest-linear once CR0.PG is set below; `build_gdt` already
        // identity-mapped this frame so CR3's page tables resolve it back
        // to itself.
        sregs.gdt.base = gdt_base.0;
        sregs.gdt.limit = gdt_limit;

        sregs.cs.selector = USER_CODE_SEL;
        sregs.cs.base = 0;
        sregs.cs.limit = 0xFFFFFFFF;
        sregs.cs.l = 1;
        sregs.cs.db = 0;
        sregs.cs.s = 1;
        sregs.cs.type_ = 0xB; // executable, read, accessed
        sregs.cs.present = 1;
        sregs.cs.dpl = 3;
        sregs.cs.g = 1;

        set_flat_user_data_segment(&mut sregs.ds);
        set_flat_user_data_segment(&mut sregs.es);
        set_flat_user_data_segment(&mut sregs.fs);
        set_flat_user_data_segment(&mut sregs.gs);
        set_flat_user_data_segment(&mut sregs.ss);

        sregs.tr.selector = tr_sel;
        sregs.tr.base = 0; // irrelevant for a system descriptor; base comes from the GDT entry
        sregs.tr.limit = (std::mem::size_of::<u64>() * 13) as u32;
        sregs.tr.type_ = 0xB; // busy 64-bit TSS
        sregs.tr.present = 1;
        sregs.tr.s = 0;

        // Same reasoning as `sregs.gdt.base` above; `build_idt` identity-maps
        // this frame too.
        sregs.idt.base = idt_base.0;
        sregs.idt.limit = 256 * 16 - 1;

        self.fd.set_sregs(&sregs)?;

        let mut regs = self.fd.get_regs()?;
        regs.rflags = 2;
        self.fd.set_regs(&regs)?;

        let entries = [
            kvm_msr_entry { index: MSR_LSTAR, data: fault_abi::SYSCALL_HANDLER_ADDR, ..Default::default() },
            kvm_msr_entry { index: MSR_STAR, data: STAR_VALUE, ..Default::default() },
            kvm_msr_entry { index: MSR_SYSCALL_MASK, data: SYSCALL_MASK_VALUE, ..Default::default() },
        ];
        let msrs = Msrs::from_entries(&entries).map_err(|_| Error::InvalidImage("bad msr list"))?;
        let written = self.fd.set_msrs(&msrs)?;
        if written != entries.len() {
            return Err(Error::PartialMsrWrite { wrote: written, expected: entries.len() });
        }

        let cpuid = kvm.get_supported_cpuid(kvm_bindings::KVM_MAX_CPUID_ENTRIES)?;
        self.fd.set_cpuid2(&cpuid)?;

        debug!("vcpu bring-up complete: cr3={:#x} gdt={:#x} idt={:#x}", sregs.cr3, gdt_base.0, idt_base.0);
        Ok(())
    }

    /// Sets the registers the program loader computed: `RIP`, `RSP`, and a
    /// cleared register file save for `RFLAGS`'s reserved bit (spec §4.5
    /// step 9).
    pub fn set_entry_regs(&mut self, rip: u64, rsp: u64) -> Result<()> {
        let regs = kvm_regs { rip, rsp, rflags: 2, ..Default::default() };
        Ok(self.fd.set_regs(&regs)?)
    }

    pub fn regs(&self) -> Result<kvm_regs> {
        Ok(self.fd.get_regs()?)
    }

    pub fn set_regs(&mut self, regs: &kvm_regs) -> Result<()> {
        Ok(self.fd.set_regs(regs)?)
    }

    pub fn sregs(&self) -> Result<kvm_sregs> {
        Ok(self.fd.get_sregs()?)
    }

    /// Retrieves and prints the general-purpose register file. Never
    /// mutates state.
    pub fn dump_regs(&self) {
        match self.fd.get_regs() {
            Ok(regs) => error!(
                "rip={:#018x} rsp={:#018x} rax={:#018x} rdi={:#018x} rsi={:#018x} rdx={:#018x}",
                regs.rip, regs.rsp, regs.rax, regs.rdi, regs.rsi, regs.rdx
            ),
            Err(e) => error!("dump_regs: failed to read register file: {e}"),
        }
    }

    /// Iterates `KVM_RUN`/exit-dispatch until the guest signals termination
    /// (a hypercall clears `running`) or a fatal exit occurs (spec §4.4's
    /// exit-reason table).
    pub fn run(&mut self, mmu: &mut Mmu, sink: &mut dyn HypercallSink) -> Result<()> {
        while self.running {
            let exit = self.fd.run()?;
            match exit {
                VcpuExit::IoOut(16, data) => {
                    let keep_running = crate::hypercall::dispatch(&mut self.fd, mmu, data, sink)?;
                    self.running = keep_running;
                }
                VcpuExit::IoOut(port, _) => {
                    warn!("ignoring OUT to unimplemented port {port:#x}");
                }
                VcpuExit::IoIn(port, data) => {
                    warn!("ignoring IN from unimplemented port {port:#x}");
                    data.fill(0xFF);
                }
                VcpuExit::Hlt => {
                    self.dump_regs();
                    return Err(Error::UnexpectedExit("guest executed HLT".into()));
                }
                VcpuExit::FailEntry(reason, cpu) => {
                    self.dump_regs();
                    return Err(Error::UnexpectedExit(format!("FAIL_ENTRY reason={reason:#x} cpu={cpu}")));
                }
                VcpuExit::InternalError => {
                    self.dump_regs();
                    return Err(Error::UnexpectedExit("INTERNAL_ERROR".into()));
                }
                VcpuExit::Shutdown => {
                    self.dump_regs();
                    return Err(Error::UnexpectedExit("SHUTDOWN".into()));
                }
                other => {
                    self.dump_regs();
                    return Err(Error::UnexpectedExit(format!("{other:?}")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdt::{SYSRET_CODE_SEL, SYSRET_DATA_SEL, USER_CODE_SEL, USER_DATA_SEL};

    #[test]
    fn star_value_resolves_to_valid_syscall_and_sysret_selectors() {
        let syscall_cs = ((STAR_VALUE >> 32) & 0xFFFF) as u16;
        let syscall_ss = syscall_cs + 8;
        assert_eq!(syscall_cs, USER_CODE_SEL & !0x3);
        assert_eq!(syscall_ss, USER_DATA_SEL & !0x3);

        let sysret_base = ((STAR_VALUE >> 48) & 0xFFFF) as u16;
        let sysret_ss = (sysret_base + 8) | 3;
        let sysret_cs = (sysret_base + 16) | 3;
        assert_eq!(sysret_ss, SYSRET_DATA_SEL | 3);
        assert_eq!(sysret_cs, SYSRET_CODE_SEL | 3);
    }
}
