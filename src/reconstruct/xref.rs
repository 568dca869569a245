//! Correlates the three views of the address space we hold: the core's
//! program headers, the live mapping list, and the kernel's NT_FILE note.
//! The result is a Layout with a resolved virtual address and file offset for
//! every region the section synthesizer wants to describe.
use crate::elf::{
    ET_DYN, ElfHeader, PT_DYNAMIC, PT_GNU_EH_FRAME, PT_INTERP, PT_LOAD, PT_NOTE, Phdr, Reader,
    Shdr, notes::FileRange, sections::string_at,
};
use crate::snapshot::{MappingKind, MemDesc};
use crate::utils;
use std::error::Error;

pub const ELF_STATIC: u32 = 1 << 0;
pub const ELF_PIE: u32 = 1 << 1;
pub const ELF_HEURISTICS: u32 = 1 << 2;
pub const ELF_STRIPPED_SHDRS: u32 = 1 << 3;

pub const PERSONALITY_SIZE: usize = 4;

/// Bitset describing what kind of animal the dumped executable was.
#[derive(Clone, Copy, Default)]
pub struct Personality(pub u32);

impl Personality {
    pub fn is_dynamic(&self) -> bool {
        self.0 & ELF_STATIC == 0
    }

    pub fn to_record(&self) -> [u8; PERSONALITY_SIZE] {
        self.0.to_le_bytes()
    }
}

/// Values recovered from the still-extant original executable because the
/// core lacks them. It is fine for most of these to stay zero (stripped
/// originals); sections fall back to UNKNOWN_SHDR_SIZE instead.
#[derive(Clone, Default)]
pub struct Fallbacks {
    pub hash_size: u64,
    pub rela_size: u64,
    pub plt_rela_size: u64,
    pub init_size: u64,
    pub fini_size: u64,
    pub got_size: u64,
    pub plt_size: u64,
    pub ehframe_size: u64,
    pub plt_vaddr: u64,
    pub ehframe_vaddr: u64,

    /// Set when .eh_frame started with four bytes of zeroes and was nudged
    /// forward, see the section builder.
    pub eh_frame_offset_workaround: bool,
}

impl Fallbacks {
    /// Reads section sizes and addresses out of the original executable's
    /// section-header table. Succeeding is optional (the original may be
    /// stripped) but it gets .got.plt, .hash and friends their real sizes.
    pub fn pull(exe: &Reader) -> Result<Self, Box<dyn Error>> {
        let mut fb = Fallbacks::default();
        let header = ElfHeader::new(exe)?;
        if header.num_sh_entries == 0 || header.string_table_index == 0 {
            return Ok(fb);
        }
        let entsize = header.sh_entry_size as usize;
        let strtab_hdr = Shdr::parse_raw(
            exe.bytes(),
            header.sh_offset as usize + header.string_table_index as usize * entsize,
            exe.sixty_four_bit,
            exe.little_endian,
        )?;
        let strtab = exe.slice(strtab_hdr.offset as usize, strtab_hdr.size as usize)?;

        for i in 0..header.num_sh_entries as usize {
            let shdr = Shdr::parse_raw(
                exe.bytes(),
                header.sh_offset as usize + i * entsize,
                exe.sixty_four_bit,
                exe.little_endian,
            )?;
            let name = match string_at(strtab, shdr.name as usize) {
                Some(name) => name,
                None => continue,
            };
            let rela_dyn = if exe.sixty_four_bit { ".rela.dyn" } else { ".rel.dyn" };
            let rela_plt = if exe.sixty_four_bit { ".rela.plt" } else { ".rel.plt" };
            match name {
                ".gnu.hash" => fb.hash_size = shdr.size,
                ".init" => fb.init_size = shdr.size,
                ".fini" => fb.fini_size = shdr.size,
                ".got.plt" => fb.got_size = shdr.size,
                ".plt" => {
                    fb.plt_size = shdr.size;
                    fb.plt_vaddr = shdr.addr;
                }
                ".eh_frame" => {
                    fb.ehframe_size = shdr.size;
                    fb.ehframe_vaddr = shdr.addr;
                }
                name if name == rela_dyn => fb.rela_size = shdr.size,
                name if name == rela_plt => fb.plt_rela_size = shdr.size,
                _ => (),
            }
        }
        Ok(fb)
    }
}

/// One shared library recovered from NT_FILE, in kernel order.
pub struct LibMapping {
    pub name: String,
    pub path: String,
    pub base: u64,
    pub size: u64,
    pub flags: u32,
    pub offset: u64,
    pub injected: bool,
}

/// The resolved address map. Everything defaults to zero and gets filled in
/// by parse_orig_phdrs() and then xref_offsets().
#[derive(Default)]
pub struct Layout {
    pub pie: bool,
    pub dynlinked: bool,

    /// Runtime entry point, for the output's e_entry.
    pub o_entry: u64,

    pub text_vaddr: u64,
    pub text_size: u64,
    pub text_offset: u64,

    pub data_vaddr: u64,
    pub data_size: u64,
    pub data_offset: u64,

    /// p_filesz of the data segment in the *original* executable, before any
    /// merging. bss starts this far into the runtime data segment.
    pub o_datafsize: u64,

    pub bss_vaddr: u64,
    pub bss_size: u64,
    pub bss_offset: u64,

    pub dyn_vaddr: u64,
    pub dyn_size: u64,
    pub dyn_offset: u64,

    pub interp_vaddr: u64,
    pub interp_size: u64,
    pub interp_offset: u64,

    pub ehframe_vaddr: u64,
    pub ehframe_size: u64,
    pub ehframe_offset: u64,

    pub note_vaddr: u64,
    pub note_offset: u64,
}

/// First NT_FILE range whose basename is the executable's: its text mapping.
pub fn lookup_text_base(files: &[FileRange], comm: &str) -> u64 {
    files
        .iter()
        .find(|f| utils::basename(&f.path) == comm)
        .map(|f| f.start)
        .unwrap_or(0)
}

pub fn lookup_text_size(files: &[FileRange], comm: &str) -> u64 {
    files
        .iter()
        .find(|f| utils::basename(&f.path) == comm)
        .map(|f| f.size())
        .unwrap_or(0)
}

/// The kernel writes a file's data mapping directly after its text mapping,
/// so the data segment is the entry following the text match.
pub fn lookup_data_base(files: &[FileRange], comm: &str) -> u64 {
    lookup_data_entry(files, comm).map(|f| f.start).unwrap_or(0)
}

pub fn lookup_data_size(files: &[FileRange], comm: &str) -> u64 {
    lookup_data_entry(files, comm).map(|f| f.size()).unwrap_or(0)
}

fn lookup_data_entry<'a>(files: &'a [FileRange], comm: &str) -> Option<&'a FileRange> {
    files
        .windows(2)
        .find(|w| {
            utils::basename(&w[0].path) == comm && utils::basename(&w[1].path) == comm
        })
        .map(|w| &w[1])
}

/// Walks the original executable's program headers and seeds the Layout with
/// the addresses the core itself cannot tell us.
pub fn parse_orig_phdrs(
    exe: &Reader,
    mem: &MemDesc,
    files: &[FileRange],
) -> Result<Layout, Box<dyn Error>> {
    let mut layout = Layout::default();
    let header = ElfHeader::new(exe)?;
    let phdrs = Phdr::parse_table(exe, &header);
    layout.pie = header.etype == ET_DYN;

    utils::require(
        mem.text.base != 0,
        "unable to locate executable base address necessary to find phdrs",
    )?;
    // During a real crashdump the NT_FILE view and the maps view agree; the
    // maps value covers cores taken from a restarted process.
    let text_base = match lookup_text_base(files, &mem.comm) {
        0 => {
            utils::warn("executable is missing from NT_FILE, using the maps base");
            mem.text.base
        }
        base => base,
    };
    let pie_bias = if layout.pie { text_base } else { 0 };

    for ph in &phdrs {
        match ph.ptype {
            PT_LOAD => {
                if ph.offset != 0 {
                    layout.data_vaddr = lookup_data_base(files, &mem.comm);
                    layout.data_size = lookup_data_size(files, &mem.comm);
                    layout.bss_size = ph.mem_size - ph.file_size;
                    layout.o_datafsize = ph.file_size;
                    if !layout.pie {
                        layout.bss_vaddr = ph.vaddr + ph.file_size;
                    }
                } else {
                    layout.text_vaddr = text_base;
                    layout.text_size = lookup_text_size(files, &mem.comm);
                }
            }
            PT_DYNAMIC => {
                layout.dyn_vaddr = ph.vaddr + pie_bias;
                layout.dyn_size = ph.mem_size;
            }
            PT_GNU_EH_FRAME => {
                layout.ehframe_vaddr = ph.vaddr + pie_bias;
                layout.ehframe_size = ph.mem_size;
            }
            PT_INTERP => {
                layout.dynlinked = true;
                layout.interp_vaddr = ph.vaddr;
                layout.interp_size = if ph.mem_size != 0 {
                    ph.mem_size
                } else {
                    ph.file_size
                };
            }
            // We want the core file's notes, not the executable's.
            PT_NOTE => (),
            _ => (),
        }
    }
    layout.o_entry = header.entry + pie_bias;
    Ok(layout)
}

/// The phdr after PT_NOTE is not reliably the text segment for PIE cores, so
/// re-resolve the cached text sizes with the runtime base as a hint.
pub fn text_phdr_size_with_hint(phdrs: &[Phdr], hint: u64) -> Option<(u64, u64)> {
    phdrs
        .iter()
        .find(|ph| ph.contains(hint))
        .map(|ph| (ph.file_size, ph.mem_size))
}

/// Resolves the on-disk offset of every interesting region against the core's
/// program headers.
pub fn xref_offsets(
    phdrs: &[Phdr],
    layout: &mut Layout,
    fallbacks: &Fallbacks,
) {
    for ph in phdrs {
        if ph.ptype == PT_NOTE {
            layout.note_offset = ph.offset;
            layout.note_vaddr = ph.vaddr;
        }
        if ph.contains(layout.interp_vaddr) {
            layout.interp_offset = ph.offset + layout.interp_vaddr - ph.vaddr;
        }
        if ph.contains(layout.dyn_vaddr) {
            layout.dyn_offset = ph.offset + layout.dyn_vaddr - ph.vaddr;
        }

        // eh_frame works differently for static binaries: they have no
        // PT_GNU_EH_FRAME, so the address came from the original executable's
        // section table instead.
        if layout.dynlinked {
            if ph.contains(layout.ehframe_vaddr) {
                layout.ehframe_offset = ph.offset + layout.ehframe_vaddr - ph.vaddr;
            }
        } else if ph.contains(fallbacks.ehframe_vaddr) {
            layout.ehframe_offset = ph.offset + fallbacks.ehframe_vaddr - ph.vaddr;
        }

        if layout.text_vaddr == ph.vaddr {
            layout.text_offset = ph.offset;
            layout.text_size = ph.mem_size;
        }
        if layout.data_vaddr == ph.vaddr {
            layout.data_offset = ph.offset;
            if layout.pie {
                layout.bss_vaddr = layout.data_vaddr + layout.o_datafsize;
            }
            layout.bss_offset = ph.offset + layout.bss_vaddr - layout.data_vaddr;
        }
    }
}

/// Builds the ordered library table out of NT_FILE, attaching the permission
/// flags seen in the maps and the file offset from the core's phdrs.
pub fn lookup_lib_maps(
    phdrs: &[Phdr],
    mem: &MemDesc,
    files: &[FileRange],
) -> Vec<LibMapping> {
    let mut libs = Vec::new();
    for file in files {
        let name = utils::basename(&file.path);
        if !name.contains(".so") {
            continue;
        }
        let flags = mem
            .maps
            .iter()
            .find(|m| m.base == file.start)
            .map(|m| m.flags)
            .unwrap_or(0);
        let offset = phdrs
            .iter()
            .find(|ph| ph.vaddr == file.start)
            .map(|ph| ph.offset)
            .unwrap_or(0);
        libs.push(LibMapping {
            name: name.to_string(),
            path: file.path.clone(),
            base: file.start,
            size: file.size(),
            flags,
            offset,
            injected: false,
        });
    }
    libs
}

/// File offset of a well-known region (heap, stack, vdso, vsyscall). The
/// kernel dumps the stack segment one page lower than it shows up in the maps
/// file, so the stack is matched by range rather than base equality.
pub fn internal_sh_offset(phdrs: &[Phdr], mem: &MemDesc, kind: MappingKind) -> u64 {
    let by_range = kind == MappingKind::Stack;
    for map in mem.maps.iter().filter(|m| m.kind == kind) {
        for ph in phdrs.iter().filter(|ph| ph.ptype == PT_LOAD) {
            let hit = if by_range {
                ph.contains(map.base)
            } else {
                ph.vaddr == map.base
            };
            if hit {
                return ph.offset;
            }
        }
    }
    0
}

/// The personality bits: STATIC when there is no program interpreter, PIE
/// when the exe is ET_DYN with an executable LOAD at vaddr zero,
/// STRIPPED_SHDRS when the original has no section table.
pub fn build_personality(
    exe: &Reader,
    layout: &Layout,
    heuristics: bool,
) -> Result<Personality, Box<dyn Error>> {
    let header = ElfHeader::new(exe)?;
    let phdrs = Phdr::parse_table(exe, &header);

    let mut bits = 0;
    if !layout.dynlinked {
        bits |= ELF_STATIC;
    }
    let load_at_zero = phdrs
        .iter()
        .any(|ph| ph.ptype == PT_LOAD && ph.executable() && ph.vaddr == 0);
    if header.etype == ET_DYN && load_at_zero {
        bits |= ELF_PIE;
    }
    if heuristics {
        bits |= ELF_HEURISTICS;
    }
    if header.num_sh_entries == 0 || header.sh_offset == 0 {
        bits |= ELF_STRIPPED_SHDRS;
    }
    Ok(Personality(bits))
}
