//! Composes the initial user address space and stack, then hands the VCPU
//! its entry registers (spec §4.5).

use fault_abi::USER_ADDRESS_LIMIT;
use rand::RngCore;

use crate::elf::ElfImage;
use crate::error::Result;
use crate::mmu::Mmu;
use crate::vcpu::Vcpu;

const STACK_SIZE: u64 = 64 * 1024;
/// Stack grows down from here; the guard byte at `USER_ADDRESS_LIMIT` itself
/// is never touched.
const STACK_TOP: u64 = USER_ADDRESS_LIMIT - 1;

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_EXECFN: u64 = 31;
const AT_RANDOM: u64 = 25;

/// Loads `target`'s segments (preceded by `kernel_stub`'s, which always
/// occupies guest page 0), composes argv/envp/auxv on a fresh stack, and
/// sets the VCPU's entry registers. `argv[0]` is expected to already be the
/// target's own path (spec §6: "prepended to `binary_argv` before passing
/// to the loader").
pub fn load(mmu: &mut Mmu, vcpu: &mut Vcpu, kernel_stub: &ElfImage, target: &ElfImage, argv: &[String]) -> Result<()> {
    // Supervisor-only: the stub occupies guest page 0 for `LSTAR`, but the
    // target must never be able to read or write it directly (see
    // `Mmu::load_elf`'s `user` parameter).
    let kernel_segments: Vec<(&crate::elf::Segment, &[u8])> =
        kernel_stub.load_segments().map(|s| (s, s.file_bytes(kernel_stub))).collect();
    mmu.load_elf(&kernel_segments, false)?;

    let target_segments: Vec<(&crate::elf::Segment, &[u8])> =
        target.load_segments().map(|s| (s, s.file_bytes(target))).collect();
    mmu.load_elf(&target_segments, true)?;

    let brk_start = target
        .load_segments()
        .map(|s| s.vaddr + s.memsize)
        .max()
        .unwrap_or(target.load_addr());
    mmu.init_brk(brk_start);

    let sp = build_stack(mmu, target, argv)?;
    vcpu.set_entry_regs(target.entry(), sp)
}

/// Builds the System V AMD64 initial stack (spec §4.5 steps 2-8), returning
/// the final `RSP`.
fn build_stack(mmu: &mut Mmu, target: &ElfImage, argv: &[String]) -> Result<u64> {
    let mut sp = STACK_TOP;
    mmu.alloc(sp - STACK_SIZE, STACK_SIZE)?;

    // Step 3a: terminator for an unused vector (two zero words).
    sp = push_u64(mmu, sp, 0)?;
    sp = push_u64(mmu, sp, 0)?;

    // Step 3b: 16 random bytes.
    let mut random_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    sp -= 16;
    sp = align_down(sp, 8);
    mmu.write_mem(sp, &random_bytes)?;
    let random_addr = sp;

    // Step 3c: argv strings, recording each guest address.
    let mut argv_addrs = Vec::with_capacity(argv.len());
    for arg in argv {
        let mut bytes = arg.as_bytes().to_vec();
        bytes.push(0);
        sp -= bytes.len() as u64;
        mmu.write_mem(sp, &bytes)?;
        argv_addrs.push(sp);
    }

    let execfn_addr = argv_addrs.first().copied().unwrap_or(random_addr);

    // Step 4: align down to an 8-byte boundary before the auxv/envp/argv area.
    sp = align_down(sp, 8);

    // Step 5: auxv, richer form when the program header table is reachable.
    let mut auxv: Vec<(u64, u64)> = Vec::new();
    if let Some((phdr_vaddr, phentsize, phnum)) = target.auxv_hints() {
        auxv.push((AT_PHDR, phdr_vaddr));
        auxv.push((AT_PHENT, phentsize));
        auxv.push((AT_PHNUM, phnum));
        auxv.push((AT_EXECFN, execfn_addr));
        auxv.push((AT_PAGESZ, crate::mmu::PAGE_SIZE));
    }
    auxv.push((AT_RANDOM, random_addr));
    auxv.push((AT_NULL, 0));

    for (key, value) in auxv.into_iter().rev() {
        sp = push_u64(mmu, sp, value)?;
        sp = push_u64(mmu, sp, key)?;
    }

    // Step 6: envp terminator (no environment variables are passed).
    sp = push_u64(mmu, sp, 0)?;

    // Step 7: argv pointers in reverse, then the terminator, then argc;
    // pushed in this order so the lowest address ends up holding argv[0].
    sp = push_u64(mmu, sp, 0)?;
    for addr in argv_addrs.iter().rev() {
        sp = push_u64(mmu, sp, *addr)?;
    }

    // Step 8: argc.
    sp = push_u64(mmu, sp, argv.len() as u64)?;

    Ok(sp)
}

fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

fn push_u64(mmu: &mut Mmu, sp: u64, value: u64) -> Result<u64> {
    let sp = sp - 8;
    mmu.write(sp, value)?;
    Ok(sp)
}
