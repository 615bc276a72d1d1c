//! Hypervisor handle and VM composition (spec §4.1, §2 control flow).

use std::path::Path;

use kvm_ioctls::Kvm;
use log::{debug, info};

use crate::elf::ElfImage;
use crate::error::{Error, Result};
use crate::hypercall::HypercallSink;
use crate::mmu::Mmu;
use crate::vcpu::Vcpu;

/// The only KVM API version this crate was written against; a mismatch is
/// fatal before any VM is constructed (spec §4.1).
const KVM_API_VERSION: i32 = 12;

/// Bytes reserved for the guest kernel stub's own page plus whatever the
/// target itself needs, rounded generously so small targets never run out
/// of demand-paged frames mid-run. Callers that need more pass their own
/// size through `Vm::new`.
pub const DEFAULT_MEMORY_BYTES: usize = 256 * 1024 * 1024;

/// Opens `/dev/kvm` and validates the kernel's reported API version. This is
/// the only type that ever touches the bare device; every `Vm` borrows it.
pub struct Hypervisor {
    kvm: Kvm,
}

impl Hypervisor {
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new()?;
        let got = kvm.get_api_version();
        if got != KVM_API_VERSION {
            return Err(Error::ApiVersionMismatch { expected: KVM_API_VERSION, got });
        }
        debug!("opened /dev/kvm, api version {got}");
        Ok(Self { kvm })
    }

    pub fn create_vm(&self, memory_bytes: usize) -> Result<Vm> {
        let vm_fd = self.kvm.create_vm()?;
        let mmu = Mmu::new(&vm_fd, memory_bytes)?;
        let vcpu = Vcpu::new(&vm_fd, 0)?;
        Ok(Vm { kvm: &self.kvm, _vm_fd: vm_fd, mmu, vcpu })
    }
}

/// Owns a single VM's VCPU, guest memory, and, once loaded, the ELF views
/// backing it (spec §3 ownership summary: "VM exclusively owns the VCPU,
/// run-area mapping, MMU, and ELF view").
pub struct Vm<'a> {
    kvm: &'a Kvm,
    _vm_fd: kvm_ioctls::VmFd,
    mmu: Mmu,
    vcpu: Vcpu,
}

impl<'a> Vm<'a> {
    /// Parses the guest kernel stub and the target, loads both, builds the
    /// initial stack, brings the VCPU up into long mode, and positions it at
    /// the target's entry point (spec §2's control-flow summary).
    pub fn load(&mut self, kernel_stub_path: &Path, target_path: &Path, argv: &[String]) -> Result<()> {
        let kernel_stub = ElfImage::load(kernel_stub_path)?;
        let target = ElfImage::load(target_path)?;

        let kernel_vectors = resolve_kernel_vectors(&kernel_stub);
        crate::loader::load(&mut self.mmu, &mut self.vcpu, &kernel_stub, &target, argv)?;
        self.vcpu.bring_up(self.kvm, &mut self.mmu, &kernel_vectors)?;

        info!("loaded {} at entry {:#x}", target_path.display(), target.entry());
        Ok(())
    }

    pub fn run(&mut self, sink: &mut dyn HypercallSink) -> Result<()> {
        self.vcpu.run(&mut self.mmu, sink)
    }
}

/// Maps the five exception vectors the guest kernel stub handles to the
/// guest-virtual addresses of their naked entry stubs (spec §4.6, SPEC_FULL
/// §4.4's `build_idt` addition). A symbol the stub is expected to export but
/// doesn't is a build-time mismatch between this crate and `guest-kernel`,
/// not a runtime condition a fuzz target can trigger, so it is fatal.
fn resolve_kernel_vectors(kernel_stub: &ElfImage) -> Vec<(u8, u64)> {
    const VECTORS: &[(u8, &str)] =
        &[(0, "vector0_entry"), (3, "vector3_entry"), (12, "vector12_entry"), (13, "vector13_entry"), (14, "vector14_entry")];

    VECTORS
        .iter()
        .map(|(vector, name)| {
            let sym = kernel_stub
                .symbols()
                .iter()
                .find(|s| s.name == *name)
                .unwrap_or_else(|| panic!("guest kernel stub missing exported symbol {name}"));
            (*vector, sym.value)
        })
        .collect()
}
