//! Builders for the synthetic ELF images the unit tests run the pipeline
//! against. Real cores are too big (and too machine-specific) to commit, so
//! tests assemble little-endian 64-bit images with exactly the segments a
//! given stage cares about.
use std::path::PathBuf;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

pub struct LoadSpec {
    pub vaddr: u64,
    pub mem_size: u64,
    pub file_size: u64,
    pub flags: u32,
    pub fill: u8,
}

/// Assembles a minimal core file: ELF header, PT_NOTE first, then LOAD
/// segments laid out page-aligned in file order, each region filled with a
/// recognizable byte pattern.
pub struct CoreBuilder {
    pub etype: u16,
    pub note: Vec<u8>,
    pub loads: Vec<LoadSpec>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        CoreBuilder {
            etype: 4, // ET_CORE
            note: vec![0u8; 16],
            loads: Vec::new(),
        }
    }

    pub fn add_load(&mut self, vaddr: u64, mem_size: u64, file_size: u64, flags: u32) {
        let fill = 0xA0 + self.loads.len() as u8;
        self.loads.push(LoadSpec {
            vaddr,
            mem_size,
            file_size,
            flags,
            fill,
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = 1 + self.loads.len();
        let hdrs_end = EHDR_SIZE + PHDR_SIZE * phnum;
        let note_offset = hdrs_end as u64;
        let mut cursor = (note_offset + self.note.len() as u64 + 0xfff) & !0xfff;

        let mut offsets = Vec::new();
        for load in &self.loads {
            offsets.push(cursor);
            cursor += load.file_size;
        }
        let total = cursor as usize;
        let mut mem = vec![0u8; total];

        write_ehdr(&mut mem, self.etype, 0, 64, phnum as u16, 0, 0, 0);

        let mut at = EHDR_SIZE;
        write_phdr(&mut mem, at, 4, 0, 0, note_offset, self.note.len() as u64, 0);
        at += PHDR_SIZE;
        for (load, offset) in self.loads.iter().zip(&offsets) {
            write_phdr(
                &mut mem,
                at,
                1,
                load.flags,
                load.vaddr,
                *offset,
                load.file_size,
                load.mem_size,
            );
            at += PHDR_SIZE;
        }

        mem[note_offset as usize..note_offset as usize + self.note.len()]
            .copy_from_slice(&self.note);
        for (load, offset) in self.loads.iter().zip(&offsets) {
            let start = *offset as usize;
            mem[start..start + load.file_size as usize].fill(load.fill);
        }
        mem
    }
}

pub struct PhdrSpec {
    pub ptype: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
}

pub struct ShdrSpec {
    pub name: &'static str,
    pub addr: u64,
    pub size: u64,
}

/// Assembles an original-executable image: arbitrary program headers plus an
/// optional section-header table (named sections with just the fields the
/// fallback puller reads).
pub struct ExeBuilder {
    pub etype: u16,
    pub entry: u64,
    pub phdrs: Vec<PhdrSpec>,
    pub shdrs: Vec<ShdrSpec>,
    pub body_size: usize,
}

impl ExeBuilder {
    pub fn new(etype: u16) -> Self {
        ExeBuilder {
            etype,
            entry: 0,
            phdrs: Vec::new(),
            shdrs: Vec::new(),
            body_size: 0x400,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let ph_end = EHDR_SIZE + PHDR_SIZE * self.phdrs.len();
        let body_end = ph_end + self.body_size;

        // Pack the shstrtab first so sh_name indexes are known.
        let mut strtab = vec![0u8];
        let mut names = Vec::new();
        for spec in &self.shdrs {
            names.push(strtab.len() as u32);
            strtab.extend_from_slice(spec.name.as_bytes());
            strtab.push(0);
        }
        let shstr_name = strtab.len() as u32;
        strtab.extend_from_slice(b".shstrtab\0");

        let (shoff, shnum, shstrndx) = if self.shdrs.is_empty() {
            (0, 0, 0)
        } else {
            (body_end as u64, self.shdrs.len() as u16 + 1, self.shdrs.len() as u16)
        };

        let strtab_offset = body_end + 64 * shnum as usize;
        let total = strtab_offset + strtab.len();
        let mut mem = vec![0u8; total];
        write_ehdr(
            &mut mem,
            self.etype,
            self.entry,
            if self.phdrs.is_empty() { 0 } else { 64 },
            self.phdrs.len() as u16,
            shoff,
            shnum,
            shstrndx,
        );

        let mut at = EHDR_SIZE;
        for ph in &self.phdrs {
            write_phdr(
                &mut mem,
                at,
                ph.ptype,
                ph.flags,
                ph.vaddr,
                ph.offset,
                ph.file_size,
                ph.mem_size,
            );
            at += PHDR_SIZE;
        }

        if !self.shdrs.is_empty() {
            let mut at = body_end;
            for (spec, name) in self.shdrs.iter().zip(&names) {
                write_shdr(&mut mem, at, *name, spec.addr, 0, spec.size);
                at += 64;
            }
            write_shdr(&mut mem, at, shstr_name, 0, strtab_offset as u64, strtab.len() as u64);
            mem[strtab_offset..strtab_offset + strtab.len()].copy_from_slice(&strtab);
        }
        mem
    }
}

/// One note entry in kernel layout: 3 words of header, NUL-terminated name
/// padded to 4 bytes, descriptor padded to 4 bytes.
pub fn note_entry(name: &str, ntype: u32, desc: &[u8]) -> Vec<u8> {
    let mut v = Vec::new();
    let namesz = name.len() as u32 + 1;
    v.extend_from_slice(&namesz.to_le_bytes());
    v.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    v.extend_from_slice(&ntype.to_le_bytes());
    v.extend_from_slice(name.as_bytes());
    v.push(0);
    while v.len() % 4 != 0 {
        v.push(0);
    }
    v.extend_from_slice(desc);
    while v.len() % 4 != 0 {
        v.push(0);
    }
    v
}

pub fn write_temp(tag: &str, bytes: &[u8]) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("ecfs-test-{}-{}", std::process::id(), tag));
    std::fs::write(&path, bytes).unwrap();
    path
}

fn write_ehdr(
    mem: &mut [u8],
    etype: u16,
    entry: u64,
    phoff: u64,
    phnum: u16,
    shoff: u64,
    shnum: u16,
    shstrndx: u16,
) {
    mem[0..4].copy_from_slice(&[0x7f, 0x45, 0x4c, 0x46]);
    mem[4] = 2; // ELFCLASS64
    mem[5] = 1; // little endian
    mem[6] = 1; // EV_CURRENT
    mem[16..18].copy_from_slice(&etype.to_le_bytes());
    mem[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    mem[20..24].copy_from_slice(&1u32.to_le_bytes());
    mem[24..32].copy_from_slice(&entry.to_le_bytes());
    mem[32..40].copy_from_slice(&phoff.to_le_bytes());
    mem[40..48].copy_from_slice(&shoff.to_le_bytes());
    mem[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    mem[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    mem[56..58].copy_from_slice(&phnum.to_le_bytes());
    mem[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    mem[60..62].copy_from_slice(&shnum.to_le_bytes());
    mem[62..64].copy_from_slice(&shstrndx.to_le_bytes());
}

fn write_phdr(
    mem: &mut [u8],
    at: usize,
    ptype: u32,
    flags: u32,
    vaddr: u64,
    offset: u64,
    file_size: u64,
    mem_size: u64,
) {
    mem[at..at + 4].copy_from_slice(&ptype.to_le_bytes());
    mem[at + 4..at + 8].copy_from_slice(&flags.to_le_bytes());
    mem[at + 8..at + 16].copy_from_slice(&offset.to_le_bytes());
    mem[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
    mem[at + 32..at + 40].copy_from_slice(&file_size.to_le_bytes());
    mem[at + 40..at + 48].copy_from_slice(&mem_size.to_le_bytes());
    mem[at + 48..at + 56].copy_from_slice(&0x1000u64.to_le_bytes());
}

fn write_shdr(mem: &mut [u8], at: usize, name: u32, addr: u64, offset: u64, size: u64) {
    mem[at..at + 4].copy_from_slice(&name.to_le_bytes());
    mem[at + 4..at + 8].copy_from_slice(&1u32.to_le_bytes()); // SHT_PROGBITS
    mem[at + 16..at + 24].copy_from_slice(&addr.to_le_bytes());
    mem[at + 24..at + 32].copy_from_slice(&offset.to_le_bytes());
    mem[at + 32..at + 40].copy_from_slice(&size.to_le_bytes());
}
