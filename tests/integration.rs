//! End-to-end tests driving a real VM: compiles small freestanding target
//! binaries with `rustc` and runs them to completion through `hostel::Vm`.
//! Gated on `/dev/kvm` being accessible and the `x86_64-unknown-none`
//! target being installed, since both are host-environment requirements a
//! plain `cargo test` cannot satisfy everywhere (spec.md §8's testable
//! scenarios, SPEC_FULL §1's test-tooling addition).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use fault_abi::{FaultInfo, FaultKind, SyscallRegs};
use hostel::{Hypervisor, HypercallSink};

fn kvm_available() -> bool {
    Path::new("/dev/kvm").exists()
}

fn compile_freestanding_binary(source: &str, output: &str) -> bool {
    let status = Command::new("rustc")
        .args([
            source,
            "-o",
            output,
            "--target",
            "x86_64-unknown-none",
            "--crate-type",
            "bin",
            "-C",
            "panic=abort",
            "-C",
            "opt-level=0",
            "-C",
            "relocation-model=static",
            "-C",
            &format!("link-arg=-T{}", Path::new("tests/bins/linker.ld").display()),
        ])
        .status();

    matches!(status, Ok(s) if s.success())
}

#[derive(Default)]
struct RecordingSink {
    faults: Vec<FaultInfo>,
    exit_status: Option<i32>,
    unhandled_syscalls: Vec<SyscallRegs>,
}

impl HypercallSink for RecordingSink {
    fn on_fault(&mut self, fault: FaultInfo) {
        self.faults.push(fault);
    }

    fn on_syscall(&mut self, regs: SyscallRegs) -> Option<i64> {
        self.unhandled_syscalls.push(regs);
        None
    }

    fn on_exit(&mut self, status: i32) {
        self.exit_status = Some(status);
    }
}

/// `rustc` invocations racing on the same output path would stomp each
/// other; the test binaries themselves are cheap enough that serializing
/// the handful of integration tests costs nothing.
static BUILD_LOCK: Mutex<()> = Mutex::new(());

fn kernel_stub_path() -> PathBuf {
    PathBuf::from(env!("GUEST_KERNEL_BIN"))
}

#[test]
fn hello_world_write_then_exit() {
    let _guard = BUILD_LOCK.lock().unwrap();
    if !kvm_available() {
        eprintln!("skipping: /dev/kvm not accessible in this environment");
        return;
    }
    let bin_path = "tests/bins/hello_bin";
    if !compile_freestanding_binary("tests/bins/hello.rs", bin_path) {
        eprintln!("skipping: could not compile freestanding x86_64-unknown-none target");
        return;
    }

    let hypervisor = Hypervisor::open().expect("failed to open /dev/kvm");
    let mut vm = hypervisor.create_vm(hostel::vm::DEFAULT_MEMORY_BYTES).expect("failed to create vm");
    vm.load(&kernel_stub_path(), Path::new(bin_path), &[bin_path.to_string()]).expect("failed to load target");

    let mut sink = RecordingSink::default();
    vm.run(&mut sink).expect("vm run failed");

    assert_eq!(sink.exit_status, Some(0));
    assert!(sink.faults.is_empty());
}

/// Guest virtual address 0 is not a hole: it's the `LSTAR` target, loaded
/// supervisor-only (`Mmu::load_elf`'s `user: false`) so `syscall` can still
/// fetch it at CPL0 while a CPL3 dereference faults. That fault is therefore
/// a present-page privilege violation (`P=1`), which `FaultKind` reports as
/// `Read`, not `OutOfBoundsRead` — there is no hardware way to tell "null
/// pointer" apart from "protected kernel page" when both are the same byte.
#[test]
fn null_read_reports_privileged_page_fault() {
    let _guard = BUILD_LOCK.lock().unwrap();
    if !kvm_available() {
        eprintln!("skipping: /dev/kvm not accessible in this environment");
        return;
    }
    let bin_path = "tests/bins/null_deref_bin";
    if !compile_freestanding_binary("tests/bins/null_deref.rs", bin_path) {
        eprintln!("skipping: could not compile freestanding x86_64-unknown-none target");
        return;
    }

    let hypervisor = Hypervisor::open().expect("failed to open /dev/kvm");
    let mut vm = hypervisor.create_vm(hostel::vm::DEFAULT_MEMORY_BYTES).expect("failed to create vm");
    vm.load(&kernel_stub_path(), Path::new(bin_path), &[bin_path.to_string()]).expect("failed to load target");

    let mut sink = RecordingSink::default();
    vm.run(&mut sink).expect("vm run failed");

    assert_eq!(sink.faults.len(), 1);
    assert_eq!(sink.faults[0].kind, FaultKind::Read);
    assert_eq!(sink.faults[0].fault_addr, 0);
    assert_eq!(sink.exit_status, None);
}
