//! Guest-physical GDT, IDT and TSS (spec §3's "GDT/IDT as guest data"
//! addition, SPEC_FULL §4.4). Unlike a transient KVM-only configuration,
//! these three tables are ordinary guest physical memory the host writes
//! once during VCPU bring-up, because nothing inside the guest ever runs
//! an initialization routine of its own before the target's entry point —
//! the host has to play "kernel" for exactly this one step.

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::error::Result;
use crate::mmu::{MapPerms, Mmu, PAGE_SIZE};

/// Ring-3 flat code segment, assigned to `CS` at entry (spec §4.4).
pub const USER_CODE_SEL: u16 = 0x08 | 3;
/// Ring-3 flat data segment, assigned to `DS`/`ES`/`FS`/`GS`/`SS` at entry.
pub const USER_DATA_SEL: u16 = 0x10 | 3;
/// Ring-0 code segment the IDT's interrupt gates transfer into; the guest
/// kernel stub's exception handlers run here, privileged enough to execute
/// the hypercall doorbell's `out` instruction.
const KERNEL_CODE_SEL: u16 = 0x18;
/// TSS descriptor selector; occupies two consecutive GDT slots (a 64-bit
/// TSS descriptor is 16 bytes).
const TSS_SEL: u16 = 0x20;

/// `SYSRET`'s target selectors are `STAR[63:48]+8` (SS) and `STAR[63:48]+16`
/// (CS), i.e. a *data-then-code* pair at consecutive slots — the reverse
/// order from `SYSCALL`'s `STAR[47:32]`/`+8` (code-then-data), which
/// [`USER_CODE_SEL`]/[`USER_DATA_SEL`] already satisfy directly. Rather than
/// reorder the existing slots (and their selectors baked in throughout this
/// crate), two duplicate flat ring-3 descriptors are appended solely for
/// `SYSRET` to target; see `STAR_VALUE`'s derivation in `vcpu.rs`.
pub(crate) const SYSRET_DATA_SEL: u16 = 0x30;
pub(crate) const SYSRET_CODE_SEL: u16 = 0x38;

const GDT_ENTRIES: usize = 8;

fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let limit_lo = (limit & 0xFFFF) as u64;
    let limit_hi = ((limit >> 16) & 0xF) as u64;
    let base_lo = (base & 0x00FF_FFFF) as u64;
    let base_hi = ((base >> 24) & 0xFF) as u64;
    limit_lo
        | (base_lo << 16)
        | ((access as u64) << 40)
        | (limit_hi << 48)
        | ((flags as u64 & 0xF) << 52)
        | (base_hi << 56)
}

/// 64-bit TSS, IA-32 SDM vol.3 figure 8-11. Only `rsp0` is meaningful here:
/// it supplies the ring-0 stack the CPU switches to on a privilege-raising
/// interrupt delivery (spec §4.6's guest stub doc comment on the
/// TSS.RSP0-backed stack switch).
#[repr(C, packed)]
struct Tss64 {
    reserved0: u32,
    rsp: [u64; 3],
    reserved1: u64,
    ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    io_map_base: u16,
}

/// Builds the flat GDT (null, user code, user data, kernel code, TSS,
/// SYSRET data/code) and the kernel-stack-backed TSS it references,
/// returning the guest-physical base and byte limit to program into
/// `sregs.gdt` and `sregs.tr`.
pub fn build_gdt(mmu: &mut Mmu) -> Result<(GuestAddress, u16, u16)> {
    let gdt_paddr = mmu.alloc_frame()?;
    let tss_paddr = mmu.alloc_frame()?;
    let kernel_stack_paddr = mmu.alloc_frame()?;

    // `sregs.gdt.base`/`TSS.RSP0` are guest-*linear* addresses once paging is
    // on — the CPU walks them through CR3 like any other memory access, so
    // these guest-physical frames must also be identity-mapped (vaddr ==
    // paddr) and present, or the first delivered exception can't load
    // `KERNEL_CODE_SEL` or push onto the ring-0 stack and the VM triple
    // faults. Supervisor-only: the target has no business touching these.
    let rw_supervisor = MapPerms { writable: true, executable: false };
    mmu.identity_map_existing(gdt_paddr, PAGE_SIZE, rw_supervisor, false)?;
    mmu.identity_map_existing(tss_paddr, PAGE_SIZE, rw_supervisor, false)?;
    mmu.identity_map_existing(kernel_stack_paddr, PAGE_SIZE, rw_supervisor, false)?;

    let user_code = descriptor(0, 0xFFFFF, 0xFB, 0xA); // P DPL3 S type=11(E,R,A) | G,L
    let user_data = descriptor(0, 0xFFFFF, 0xF3, 0xA); // P DPL3 S type=3(W,A) | G,L
    let kernel_code = descriptor(0, 0xFFFFF, 0x9B, 0xA); // P DPL0 S type=11(E,R,A) | G,L

    let tss_limit = (std::mem::size_of::<Tss64>() - 1) as u32;
    let tss_low = descriptor(tss_paddr as u32, tss_limit, 0x89, 0x0); // P DPL0 type=9 (64-bit TSS, available)
    let tss_high = (tss_paddr >> 32) & 0xFFFF_FFFF;

    // Bit-for-bit identical to user_data/user_code; these two slots exist
    // only so SYSRET has a data-then-code pair at the selectors STAR's high
    // half names (see SYSRET_DATA_SEL/SYSRET_CODE_SEL above).
    let sysret_data = user_data;
    let sysret_code = user_code;

    let gdt: [u64; GDT_ENTRIES] =
        [0, user_code, user_data, kernel_code, tss_low, tss_high, sysret_data, sysret_code];

    let mem = mmu_memory(mmu);
    for (i, entry) in gdt.iter().enumerate() {
        mem.write_obj(*entry, GuestAddress(gdt_paddr + (i as u64) * 8))?;
    }

    // Kernel stack grows down from the top of the frame reserved for it;
    // RSP0 must already be 16-byte aligned, which a page boundary is.
    let tss = Tss64 {
        reserved0: 0,
        rsp: [kernel_stack_paddr + crate::mmu::PAGE_SIZE, 0, 0],
        reserved1: 0,
        ist: [0; 7],
        reserved2: 0,
        reserved3: 0,
        io_map_base: std::mem::size_of::<Tss64>() as u16,
    };
    let tss_bytes = unsafe {
        std::slice::from_raw_parts(&tss as *const Tss64 as *const u8, std::mem::size_of::<Tss64>())
    };
    mem.write_slice(tss_bytes, GuestAddress(tss_paddr))?;

    let gdt_limit = (GDT_ENTRIES * 8 - 1) as u16;
    Ok((GuestAddress(gdt_paddr), gdt_limit, TSS_SEL))
}

/// A 64-bit interrupt gate descriptor, IA-32 SDM vol.3 figure 6-8.
fn interrupt_gate(handler_vaddr: u64, selector: u16) -> [u64; 2] {
    let offset_lo = handler_vaddr & 0xFFFF;
    let offset_mid = (handler_vaddr >> 16) & 0xFFFF;
    let offset_hi = handler_vaddr >> 32;
    const PRESENT: u64 = 1 << 15;
    const GATE_TYPE_INTERRUPT: u64 = 0xE << 8; // 64-bit interrupt gate
    let low = offset_lo | ((selector as u64) << 16) | GATE_TYPE_INTERRUPT | PRESENT | (offset_mid << 48);
    let high = offset_hi;
    [low, high]
}

/// Builds a 256-gate IDT with present gates only for the five vectors the
/// guest kernel stub handles (`#DE`, `#BP`, `#SS`, `#GP`, `#PF`), each
/// pointed at the matching naked entry stub exported by the guest kernel
/// ELF (spec §4.6). Every gate targets [`KERNEL_CODE_SEL`] so delivery
/// raises privilege from the target's ring 3 to the stub's ring 0.
pub fn build_idt(mmu: &mut Mmu, vectors: &[(u8, u64)]) -> Result<GuestAddress> {
    let idt_paddr = mmu.alloc_frame()?;
    // Same reasoning as `build_gdt`: `sregs.idt.base` is walked through CR3.
    mmu.identity_map_existing(idt_paddr, PAGE_SIZE, MapPerms { writable: true, executable: false }, false)?;
    let mem = mmu_memory(mmu);
    for (vector, handler_vaddr) in vectors {
        let gate = interrupt_gate(*handler_vaddr, KERNEL_CODE_SEL);
        let base = idt_paddr + (*vector as u64) * 16;
        mem.write_obj(gate[0], GuestAddress(base))?;
        mem.write_obj(gate[1], GuestAddress(base + 8))?;
    }
    Ok(GuestAddress(idt_paddr))
}

/// `Mmu` keeps its guest memory private; bring-up needs raw slot access to
/// lay out tables that are not part of the MMU's own page-table/brk model.
/// This is the one place outside `mmu.rs` allowed to reach in, and it does
/// so through a crate-visible accessor rather than a public field.
fn mmu_memory(mmu: &mut Mmu) -> &GuestMemoryMmap<()> {
    mmu.raw_memory()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_encodes_user_code_segment_fields() {
        let d = descriptor(0, 0xFFFFF, 0xFB, 0xA);
        assert_eq!(d & 0xFFFF, 0xFFFF); // limit[0:15]
        assert_eq!((d >> 40) & 0xFF, 0xFB); // access byte
        assert_eq!((d >> 52) & 0xF, 0xA); // flags nibble (G=1, L=1)
        assert_eq!((d >> 48) & 0xF, 0xF); // limit[16:19]
    }

    #[test]
    fn interrupt_gate_selector_and_type_are_set() {
        let gate = interrupt_gate(0x1234_5678_9abc, KERNEL_CODE_SEL);
        assert_eq!((gate[0] >> 16) & 0xFFFF, KERNEL_CODE_SEL as u64);
        assert_eq!((gate[0] >> 8) & 0xFF, 0b1000_1110); // present, DPL0, type=0xE
        assert_eq!(gate[0] & 0xFFFF, 0x9abc);
        assert_eq!((gate[0] >> 48) & 0xFFFF, 0x5678);
        assert_eq!(gate[1], 0x1234);
    }
}
