//! 64-bit x86_64 ELF decoding (spec §3 "ELF image", §4.3).
//!
//! Parses once, eagerly, on top of `goblin`, and repackages the result into
//! this crate's own [`Segment`]/[`Section`]/[`Symbol`] value types so the
//! MMU and program loader never see a `goblin` type. The source file stays
//! `mmap`ped for the lifetime of the [`ElfImage`]; segment/section byte
//! slices borrow directly from that mapping.

use goblin::elf::Elf;
use goblin::elf::header::{EM_X86_64, ELFCLASS64, ELFDATA2LSB};
use goblin::elf::program_header::{PT_INTERP, PT_LOAD};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

use crate::error::{Error, Result};

/// The three meaningful `p_flags`/`sh_flags` permission bits. A hand-rolled
/// three-value set rather than a `bitflags` dependency for this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegFlags(u32);

impl SegFlags {
    pub const R: Self = Self(0b001);
    pub const W: Self = Self(0b010);
    pub const X: Self = Self(0b100);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for SegFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub ty: u32,
    pub flags: SegFlags,
    pub file_offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesize: u64,
    pub memsize: u64,
    pub align: u64,
}

impl Segment {
    pub fn is_load(&self) -> bool {
        self.ty == PT_LOAD
    }

    /// The segment's on-disk bytes, borrowed from the owning [`ElfImage`].
    pub fn file_bytes<'a>(&self, image: &'a ElfImage) -> &'a [u8] {
        let start = self.file_offset as usize;
        let end = start + self.filesize as usize;
        &image.mmap[start..end]
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub ty: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub ty: u8,
    pub binding: u8,
    pub visibility: u8,
    pub shndx: usize,
    pub value: u64,
    pub size: u64,
}

/// `(phdr_vaddr, phentsize, phnum)`, present when the image's own program
/// header table is reachable inside a `PT_LOAD` range after load — used to
/// build the richer `AT_PHDR`/`AT_PHENT`/`AT_PHNUM` auxv entries (spec
/// §4.5 step 5's "optional richer auxv", SPEC_FULL §4.3 addition).
pub type AuxvHints = (u64, u64, u64);

pub struct ElfImage {
    mmap: Mmap,
    entry: u64,
    load_addr: u64,
    interpreter: String,
    phoff: u64,
    phentsize: u64,
    phnum: u64,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl ElfImage {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let elf = Elf::parse(&mmap)?;

        if elf.header.e_ident[goblin::elf::header::EI_CLASS] != ELFCLASS64 {
            return Err(Error::InvalidImage("not a 64-bit ELF"));
        }
        if elf.header.e_ident[goblin::elf::header::EI_DATA] != ELFDATA2LSB {
            return Err(Error::InvalidImage("not little-endian"));
        }
        if elf.header.e_machine != EM_X86_64 {
            return Err(Error::InvalidImage("not x86_64"));
        }

        let segments: Vec<Segment> = elf
            .program_headers
            .iter()
            .map(|ph| Segment {
                ty: ph.p_type,
                flags: seg_flags(ph.p_flags),
                file_offset: ph.p_offset,
                vaddr: ph.p_vaddr,
                paddr: ph.p_paddr,
                filesize: ph.p_filesz,
                memsize: ph.p_memsz,
                align: ph.p_align.max(1),
            })
            .collect();

        if !segments.iter().any(Segment::is_load) {
            return Err(Error::InvalidImage("no PT_LOAD segment"));
        }

        let load_addr = segments
            .iter()
            .filter(|s| s.is_load())
            .map(|s| s.vaddr)
            .min()
            .expect("checked for at least one PT_LOAD above");

        let interpreter = segments
            .iter()
            .find(|s| s.ty == PT_INTERP)
            .map(|s| {
                let start = s.file_offset as usize;
                let end = start + s.filesize as usize;
                String::from_utf8_lossy(&mmap[start..end])
                    .trim_end_matches('\0')
                    .to_string()
            })
            .unwrap_or_default();

        let sections = elf
            .section_headers
            .iter()
            .map(|sh| Section {
                name: elf
                    .shdr_strtab
                    .get_at(sh.sh_name)
                    .unwrap_or("<unknown>")
                    .to_string(),
                ty: sh.sh_type,
                flags: sh.sh_flags,
                addr: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
                link: sh.sh_link,
                info: sh.sh_info,
                addralign: sh.sh_addralign,
                entsize: sh.sh_entsize,
            })
            .collect();

        let mut symbols = Vec::new();
        for sym in elf.syms.iter() {
            let name = elf.strtab.get_at(sym.st_name).unwrap_or("").to_string();
            symbols.push(Symbol {
                name,
                ty: sym.st_type(),
                binding: sym.st_bind(),
                visibility: sym.st_visibility(),
                shndx: sym.st_shndx,
                value: sym.st_value,
                size: sym.st_size,
            });
        }
        for sym in elf.dynsyms.iter() {
            let name = elf.dynstrtab.get_at(sym.st_name).unwrap_or("").to_string();
            symbols.push(Symbol {
                name,
                ty: sym.st_type(),
                binding: sym.st_bind(),
                visibility: sym.st_visibility(),
                shndx: sym.st_shndx,
                value: sym.st_value,
                size: sym.st_size,
            });
        }

        if elf.header.e_entry < load_addr {
            return Err(Error::InvalidImage("entry point below load address"));
        }

        Ok(Self {
            mmap,
            entry: elf.header.e_entry,
            load_addr,
            interpreter,
            phoff: elf.header.e_phoff,
            phentsize: elf.header.e_phentsize as u64,
            phnum: elf.header.e_phnum as u64,
            segments,
            sections,
            symbols,
        })
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn load_addr(&self) -> u64 {
        self.load_addr
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn load_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_load())
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// `(phdr_vaddr, phentsize, phnum)` when the program header table
    /// itself lies inside a loaded range, per `SPEC_FULL.md` §4.3.
    pub fn auxv_hints(&self) -> Option<AuxvHints> {
        let phdr_vaddr = self.load_addr.checked_add(self.phoff)?;
        let covered = self.load_segments().any(|s| {
            phdr_vaddr >= s.vaddr && phdr_vaddr + self.phentsize * self.phnum <= s.vaddr + s.memsize
        });
        covered.then_some((phdr_vaddr, self.phentsize, self.phnum))
    }
}

fn seg_flags(p_flags: u32) -> SegFlags {
    use goblin::elf::program_header::{PF_R, PF_W, PF_X};
    let mut flags = SegFlags::empty();
    if p_flags & PF_R != 0 {
        flags = flags | SegFlags::R;
    }
    if p_flags & PF_W != 0 {
        flags = flags | SegFlags::W;
    }
    if p_flags & PF_X != 0 {
        flags = flags | SegFlags::X;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seg_flags_decode_all_combinations() {
        use goblin::elf::program_header::{PF_R, PF_W, PF_X};
        assert!(seg_flags(PF_R).contains(SegFlags::R));
        assert!(!seg_flags(PF_R).contains(SegFlags::W));
        assert!(seg_flags(PF_R | PF_W).contains(SegFlags::W));
        assert!(seg_flags(PF_R | PF_X).contains(SegFlags::X));
    }
}
