//! Thin `clap` wrapper: `hostel run <binary> [args..]` (SPEC_FULL §2 addition).
//! Everything past argument parsing belongs to the core; this binary's own
//! logic is deliberately out of scope (corpus scanning, crash triage).

use clap::Parser;
use hostel::cli::Args;
use hostel::error::Error;
use hostel::{Hypervisor, HypercallSink};
use log::error;

/// A sink that logs whatever the core reports and never interprets it —
/// the real crash/coverage sinks are the out-of-core orchestrator's job
/// (spec §6).
struct LoggingSink;

impl HypercallSink for LoggingSink {
    fn on_fault(&mut self, fault: fault_abi::FaultInfo) {
        error!("guest fault: {fault:?}");
    }

    fn on_syscall(&mut self, regs: fault_abi::SyscallRegs) -> Option<i64> {
        error!("unhandled syscall nr={}", regs.nr);
        None
    }

    fn on_exit(&mut self, status: i32) {
        println!("guest exited with status {status}");
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("hostel: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let hypervisor = Hypervisor::open()?;
    let mut vm = hypervisor.create_vm(args.memory_bytes as usize)?;

    let mut argv = vec![args.binary_path.display().to_string()];
    argv.extend(args.binary_argv.iter().cloned());

    vm.load(&args.kernel_path, &args.binary_path, &argv)?;

    let mut sink = LoggingSink;
    vm.run(&mut sink)
}
