//! Guest physical memory and the 4-level page table (spec §3, §4.2).
//!
//! The `Mmu` is the sole owner of guest physical memory and of every
//! page-table frame drawn from it. Everything else — the program loader,
//! the hypercall dispatcher — reaches guest memory exclusively through
//! these methods; nobody else holds a pointer into the buffer that outlives
//! a single call (spec §9's raw-page-table-manipulation design note).

use fault_abi::{PAGE_TABLE_PADDR, USER_ADDRESS_LIMIT};
use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{Bytes, GuestAddress, GuestMemoryBackend, GuestMemoryMmap};

use crate::elf::Segment;
use crate::error::{Error, Result};

pub const PAGE_SIZE: u64 = 0x1000;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
#[allow(dead_code)]
const PTE_WRITE_THROUGH: u64 = 1 << 3;
#[allow(dead_code)]
const PTE_CACHE_DISABLE: u64 = 1 << 4;
#[allow(dead_code)]
const PTE_ACCESSED: u64 = 1 << 5;
#[allow(dead_code)]
const PTE_DIRTY: u64 = 1 << 6;
#[allow(dead_code)]
const PTE_PAGE_SIZE: u64 = 1 << 7;
#[allow(dead_code)]
const PTE_GLOBAL: u64 = 1 << 8;
const PTE_NX: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// `[0, 0x800000000000)` — the half-open interval of guest-virtual
/// addresses the MMU is willing to map with the `User` bit set (spec §3
/// Glossary "user range").
pub const fn is_user_address(addr: u64) -> bool {
    addr < USER_ADDRESS_LIMIT
}

pub const fn is_user_range(addr: u64, len: u64) -> bool {
    if len == 0 {
        return true;
    }
    match addr.checked_add(len) {
        Some(end) => end <= USER_ADDRESS_LIMIT,
        None => false,
    }
}

fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn pml4_index(vaddr: u64) -> u64 {
    (vaddr >> 39) & 0x1FF
}
fn pdpt_index(vaddr: u64) -> u64 {
    (vaddr >> 30) & 0x1FF
}
fn pd_index(vaddr: u64) -> u64 {
    (vaddr >> 21) & 0x1FF
}
fn pt_index(vaddr: u64) -> u64 {
    (vaddr >> 12) & 0x1FF
}

/// Requested flags for a user mapping; `R` is implicit in every mapping
/// this MMU creates.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapPerms {
    pub writable: bool,
    pub executable: bool,
}

pub struct Mmu {
    mem: GuestMemoryMmap<()>,
    size: u64,
    next_page_alloc: u64,
    brk: u64,
    min_brk: u64,
}

impl Mmu {
    /// Rounds `requested_size` up to a page multiple, allocates the
    /// host-side buffer, registers it as guest physical memory at guest
    /// physical address 0, and reserves the level-4 page table's frame at
    /// `PAGE_TABLE_PADDR`.
    pub fn new(vm: &VmFd, requested_size: usize) -> Result<Self> {
        let size = page_align_up(requested_size as u64);
        let mem: GuestMemoryMmap<()> =
            GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)])?;

        unsafe {
            vm.set_user_memory_region(kvm_userspace_memory_region {
                slot: 0,
                guest_phys_addr: 0,
                memory_size: size,
                userspace_addr: mem.get_host_address(GuestAddress(0)).unwrap() as u64,
                flags: 0,
            })?;
        }

        mem.write_slice(&[0u8; PAGE_SIZE as usize], GuestAddress(PAGE_TABLE_PADDR))?;

        let mut mmu = Self {
            mem,
            size,
            next_page_alloc: PAGE_TABLE_PADDR,
            brk: 0,
            min_brk: 0,
        };
        // First frame handed out by the allocator is the one right after
        // the level-4 table itself (spec §3 frame allocator state).
        let reserved = mmu.alloc_frame()?;
        debug_assert_eq!(reserved, PAGE_TABLE_PADDR);
        Ok(mmu)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Escape hatch for VCPU bring-up (spec §4.4/SPEC_FULL's GDT/IDT/TSS
    /// addition), which needs to lay out guest-physical tables that are
    /// not part of the page-table/brk model this type otherwise owns.
    pub(crate) fn raw_memory(&self) -> &GuestMemoryMmap<()> {
        &self.mem
    }

    /// Returns `next_page_alloc`, advances it by one page. Fatal — the
    /// substrate has no recovery path from exhausted guest memory.
    pub fn alloc_frame(&mut self) -> Result<u64> {
        if self.next_page_alloc + PAGE_SIZE > self.size {
            return Err(Error::FramesExhausted);
        }
        let frame = self.next_page_alloc;
        self.next_page_alloc += PAGE_SIZE;
        Ok(frame)
    }

    fn zero_frame(&self, paddr: u64) -> Result<()> {
        Ok(self
            .mem
            .write_slice(&[0u8; PAGE_SIZE as usize], GuestAddress(paddr))?)
    }

    fn read_pte(&self, table_paddr: u64, index: u64) -> Result<u64> {
        Ok(self
            .mem
            .read_obj::<u64>(GuestAddress(table_paddr + index * 8))?)
    }

    fn write_pte(&self, table_paddr: u64, index: u64, value: u64) -> Result<()> {
        Ok(self
            .mem
            .write_obj(value, GuestAddress(table_paddr + index * 8))?)
    }

    /// Walks the four levels starting at `ptl4` (always `PAGE_TABLE_PADDR`),
    /// creating intermediate tables on demand. Returns the guest-physical
    /// address of the *leaf* entry's slot — not its value — so callers read
    /// or overwrite it directly.
    pub fn get_pte(&mut self, vaddr: u64) -> Result<u64> {
        let indices = [pml4_index(vaddr), pdpt_index(vaddr), pd_index(vaddr)];
        let mut table = PAGE_TABLE_PADDR;
        for index in indices {
            let entry = self.read_pte(table, index)?;
            table = if entry & PTE_PRESENT != 0 {
                entry & PTE_ADDR_MASK
            } else {
                let frame = self.alloc_frame()?;
                self.zero_frame(frame)?;
                self.write_pte(table, index, frame | PTE_PRESENT | PTE_WRITABLE | PTE_USER)?;
                frame
            };
        }
        Ok(table + pt_index(vaddr) * 8)
    }

    /// Reads the leaf entry; materializes a fresh zero frame on a miss.
    /// Returns the guest-physical address (frame base | page offset).
    pub fn virt_to_phys(&mut self, vaddr: u64) -> Result<u64> {
        let pte_addr = self.get_pte(vaddr)?;
        let entry = self.mem.read_obj::<u64>(GuestAddress(pte_addr))?;
        let frame = if entry & PTE_PRESENT != 0 {
            entry & PTE_ADDR_MASK
        } else {
            let frame = self.alloc_frame()?;
            self.zero_frame(frame)?;
            self.mem.write_obj(
                frame | PTE_PRESENT | PTE_WRITABLE | PTE_USER,
                GuestAddress(pte_addr),
            )?;
            frame
        };
        Ok(frame | (vaddr & (PAGE_SIZE - 1)))
    }

    /// Byte-granular guest read, splitting at page boundaries. Every page
    /// touched is materialized (demand-allocate-on-access, spec §9's
    /// "host-side writes implicitly materialize" note applies symmetrically
    /// to host-side reads — only guest-initiated accesses must not).
    pub fn read_mem(&mut self, dst: &mut [u8], src_vaddr: u64) -> Result<()> {
        let mut done = 0usize;
        while done < dst.len() {
            let vaddr = src_vaddr + done as u64;
            let page_off = (vaddr & (PAGE_SIZE - 1)) as usize;
            let chunk = (PAGE_SIZE as usize - page_off).min(dst.len() - done);
            let phys = self.virt_to_phys(vaddr)?;
            self.mem
                .read_slice(&mut dst[done..done + chunk], GuestAddress(phys))?;
            done += chunk;
        }
        Ok(())
    }

    pub fn write_mem(&mut self, dst_vaddr: u64, src: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < src.len() {
            let vaddr = dst_vaddr + done as u64;
            let page_off = (vaddr & (PAGE_SIZE - 1)) as usize;
            let chunk = (PAGE_SIZE as usize - page_off).min(src.len() - done);
            let phys = self.virt_to_phys(vaddr)?;
            self.mem
                .write_slice(&src[done..done + chunk], GuestAddress(phys))?;
            done += chunk;
        }
        Ok(())
    }

    pub fn set_mem(&mut self, vaddr: u64, byte: u8, len: u64) -> Result<()> {
        let mut done = 0u64;
        while done < len {
            let va = vaddr + done;
            let page_off = va & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - page_off).min(len - done) as usize;
            let phys = self.virt_to_phys(va)?;
            self.mem
                .write_slice(&vec![byte; chunk], GuestAddress(phys))?;
            done += chunk as u64;
        }
        Ok(())
    }

    /// Forces materialization of every page covering `[start, start+len)`.
    pub fn alloc(&mut self, start: u64, len: u64) -> Result<()> {
        let mut vaddr = page_align_down(start);
        let end = start + len;
        while vaddr < end {
            self.virt_to_phys(vaddr)?;
            vaddr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Sets the permission bits on every page already covering
    /// `[start, start+len)`. Used after `load_elf`/`write_mem` have
    /// materialized pages as `Writable` by default, to narrow them down to
    /// the segment's real `R`/`W`/`X` flags. `user` controls the `User` bit:
    /// `false` makes the range readable/writable by the CPU only while it is
    /// already at CPL0 (the GDT/IDT/TSS/kernel-stack frames in `gdt.rs`, and
    /// the guest kernel stub's own page — see `identity_map_existing`).
    fn set_range_perms_with_privilege(&mut self, start: u64, len: u64, perms: MapPerms, user: bool) -> Result<()> {
        let mut vaddr = page_align_down(start);
        let end = start + len;
        while vaddr < end {
            let pte_addr = self.get_pte(vaddr)?;
            let entry = self.mem.read_obj::<u64>(GuestAddress(pte_addr))?;
            let frame = entry & PTE_ADDR_MASK;
            let mut bits = frame | PTE_PRESENT;
            if user {
                bits |= PTE_USER;
            }
            if perms.writable {
                bits |= PTE_WRITABLE;
            }
            if !perms.executable {
                bits |= PTE_NX;
            }
            self.mem.write_obj(bits, GuestAddress(pte_addr))?;
            vaddr += PAGE_SIZE;
        }
        Ok(())
    }

    fn set_range_perms(&mut self, start: u64, len: u64, perms: MapPerms) -> Result<()> {
        self.set_range_perms_with_privilege(start, len, perms, true)
    }

    /// Wires `[paddr, paddr+len)` into the page table at `vaddr == paddr`
    /// (identity mapping), pointing at the guest-physical frames the caller
    /// already owns and has written — unlike `map_range`/`alloc`, this never
    /// materializes a fresh frame. For guest-physical structures the CPU
    /// itself translates through `CR3` (GDT, IDT, TSS, kernel stack: spec
    /// §4.4's addition) once `sregs.gdt.base`/`sregs.idt.base`/`TSS.RSP0` are
    /// programmed with their guest-physical address and paging is enabled,
    /// that address is interpreted as guest-*linear*, so it must resolve
    /// through this same page table. `user` is normally `false` for these —
    /// the target has no business reading or writing its own descriptor
    /// tables or kernel stack.
    pub fn identity_map_existing(&mut self, paddr: u64, len: u64, perms: MapPerms, user: bool) -> Result<()> {
        debug_assert_eq!(paddr & (PAGE_SIZE - 1), 0, "identity_map_existing requires a page-aligned paddr");
        let mut addr = paddr;
        let end = paddr + len;
        while addr < end {
            let pte_addr = self.get_pte(addr)?;
            let mut bits = addr | PTE_PRESENT;
            if user {
                bits |= PTE_USER;
            }
            if perms.writable {
                bits |= PTE_WRITABLE;
            }
            if !perms.executable {
                bits |= PTE_NX;
            }
            self.mem.write_obj(bits, GuestAddress(pte_addr))?;
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Returns a host pointer whose byte at offset zero corresponds to the
    /// guest byte at `vaddr`, valid for at least one byte and for every
    /// subsequent byte up to the end of that page (spec §4.2). Materializes
    /// the page on a miss, same as `read_mem`/`write_mem`.
    pub fn translate(&mut self, vaddr: u64) -> Result<*mut u8> {
        let phys = self.virt_to_phys(vaddr)?;
        self.mem
            .get_host_address(GuestAddress(phys))
            .map_err(|_| Error::InvalidImage("guest-physical address not backed by host memory"))
    }

    /// Commits every `PT_LOAD` segment to guest memory, in the order given.
    /// First `filesize` bytes come from the file, the remaining
    /// `memsize - filesize` bytes are zero-filled; permissions are applied
    /// only after the bytes are in place. `user` is `false` for the guest
    /// kernel stub (it occupies guest page 0, the `LSTAR` target — CPL0
    /// fetches and the CPU's own GDT/IDT/TSS reads are privileged accesses
    /// that never consult the `User` bit, so marking the stub supervisor-
    /// only still lets `syscall`/interrupt delivery reach it while a CPL3
    /// dereference of address 0 now faults instead of silently reading the
    /// stub's own code bytes) and `true` for the target's own segments.
    pub fn load_elf(&mut self, segments: &[(&Segment, &[u8])], user: bool) -> Result<()> {
        for (segment, data) in segments {
            if !segment.is_load() {
                continue;
            }
            self.write_mem(segment.vaddr, data)?;
            let zero_len = segment.memsize - segment.filesize;
            if zero_len > 0 {
                self.set_mem(segment.vaddr + segment.filesize, 0, zero_len)?;
            }
            let perms = MapPerms {
                writable: segment.flags.contains(crate::elf::SegFlags::W),
                executable: segment.flags.contains(crate::elf::SegFlags::X),
            };
            self.set_range_perms_with_privilege(segment.vaddr, segment.memsize.max(1), perms, user)?;
        }
        Ok(())
    }

    pub fn get_brk(&self) -> u64 {
        self.brk
    }

    /// Sets `(brk, min_brk)` the first time, establishing the floor; later
    /// calls grow or shrink `brk` subject to `new_brk >= min_brk`.
    pub fn init_brk(&mut self, initial: u64) {
        let initial = page_align_up(initial);
        self.brk = initial;
        self.min_brk = initial;
    }

    /// Succeeds and returns `true` iff `new_brk >= min_brk` and
    /// `[brk, new_brk)` can be mapped `User | Writable | NX`; on success
    /// maps the newly added range and updates `brk`. Leaves state
    /// unchanged on failure.
    pub fn set_brk(&mut self, new_brk: u64) -> bool {
        if new_brk < self.min_brk || !is_user_address(new_brk) {
            return false;
        }
        if new_brk > self.brk {
            let grow_start = self.brk;
            let grow_len = new_brk - grow_start;
            if self.alloc(grow_start, grow_len).is_err() {
                return false;
            }
            if self
                .set_range_perms(grow_start, grow_len.max(1), MapPerms { writable: true, executable: false })
                .is_err()
            {
                return false;
            }
        }
        self.brk = new_brk;
        true
    }

    /// Named, non-fatal counterpart backing `alloc`/`load_elf`/`set_brk`:
    /// maps `[start, start+len)` with `perms`, refusing a range outside
    /// user space, or one that overlaps an already-present page unless
    /// `discard_already_mapped` is set.
    pub fn map_range(&mut self, start: u64, len: u64, perms: MapPerms, discard_already_mapped: bool) -> bool {
        if !is_user_range(start, len) {
            return false;
        }
        if !discard_already_mapped {
            let mut vaddr = page_align_down(start);
            let end = start + len;
            while vaddr < end {
                let Ok(pte_addr) = self.get_pte(vaddr) else { return false };
                let Ok(entry) = self.mem.read_obj::<u64>(GuestAddress(pte_addr)) else { return false };
                if entry & PTE_PRESENT != 0 {
                    return false;
                }
                vaddr += PAGE_SIZE;
            }
        }
        if self.alloc(start, len).is_err() {
            return false;
        }
        self.set_range_perms(start, len.max(1), perms).is_ok()
    }

    /// Clears the mapping for every page in `[start, start+len)`. A page
    /// that is not mapped is an error unless `ignore_not_mapped` is set.
    /// Frames are not returned to the allocator (spec §3's bump-only note).
    pub fn unmap_range(&mut self, start: u64, len: u64, ignore_not_mapped: bool) -> bool {
        let mut vaddr = page_align_down(start);
        let end = start + len;
        while vaddr < end {
            let Ok(pte_addr) = self.get_pte(vaddr) else { return false };
            let Ok(entry) = self.mem.read_obj::<u64>(GuestAddress(pte_addr)) else { return false };
            if entry & PTE_PRESENT == 0 {
                if !ignore_not_mapped {
                    return false;
                }
            } else if self.mem.write_obj(0u64, GuestAddress(pte_addr)).is_err() {
                return false;
            }
            vaddr += PAGE_SIZE;
        }
        true
    }

    /// Size-`sizeof(T)` wrapper over the byte interface. Does not assume
    /// `T`'s natural alignment holds in guest memory.
    pub fn read<T: Copy>(&mut self, vaddr: u64) -> Result<T> {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.read_mem(&mut buf, vaddr)?;
        // SAFETY: `T: Copy` is the caller's promise that T is plain data;
        // `buf` holds exactly `size_of::<T>()` initialized bytes.
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
    }

    pub fn write<T: Copy>(&mut self, vaddr: u64, value: T) -> Result<()> {
        let len = std::mem::size_of::<T>();
        let mut buf = vec![0u8; len];
        unsafe { std::ptr::write_unaligned(buf.as_mut_ptr() as *mut T, value) };
        self.write_mem(vaddr, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_address_containment() {
        assert!(is_user_address(0));
        assert!(is_user_address(USER_ADDRESS_LIMIT - 1));
        assert!(!is_user_address(USER_ADDRESS_LIMIT));
    }

    #[test]
    fn user_range_containment() {
        assert!(is_user_range(0, 0));
        assert!(is_user_range(USER_ADDRESS_LIMIT - 1, 1));
        assert!(!is_user_range(USER_ADDRESS_LIMIT - 1, 2));
        assert!(!is_user_range(u64::MAX, 1));
    }
}
