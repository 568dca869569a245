//! Turns the merged core into the final output: appends the forensic
//! payloads, synthesizes the section-header table and patches the ELF header
//! to describe it. After this pass the file is a complete ECFS image except
//! for the reconstructed symbol tables, which the symtab pass injects.
use super::{Handle, LibMapping};
use crate::elf::notes::{ELF_PRARGSZ, PRSTATUS_SIZE, SIGINFO_SIZE};
use crate::elf::sections::{
    SHDR_SIZE_32, SHDR_SIZE_64, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_DYNAMIC, SHT_DYNSYM,
    SHT_GNU_HASH, SHT_INJECTED, SHT_NOTE, SHT_PROGBITS, SHT_REL, SHT_RELA, SHT_SHLIB, SHT_STRTAB,
    SHT_SYMTAB, Shdr, UNKNOWN_SHDR_SIZE,
};
use crate::elf::{header, io::get_word};
use crate::snapshot::{MappingKind, fds};
use crate::utils;
use memmap2::MmapMut;
use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Where every appended payload and the section table landed in the output.
/// The symbol reconstructor consumes this by value, the text section index
/// included, so nothing about the output's geometry lives in hidden state.
#[derive(Clone, Default)]
pub struct EcfsFile {
    pub prstatus_offset: u64,
    pub prstatus_size: u64,
    pub fdinfo_offset: u64,
    pub fdinfo_size: u64,
    pub siginfo_offset: u64,
    pub siginfo_size: u64,
    pub auxv_offset: u64,
    pub auxv_size: u64,
    pub exepath_offset: u64,
    pub exepath_size: u64,
    pub personality_offset: u64,
    pub personality_size: u64,
    pub arglist_offset: u64,
    pub arglist_size: u64,

    /// e_shoff of the output.
    pub stb_offset: u64,

    pub section_count: u16,
    pub text_shdr_index: u16,
}

pub fn core2ecfs(outfile: &Path, handle: &mut Handle) -> Result<EcfsFile, Box<dyn Error>> {
    let core_size = handle.core.size();
    let fdinfo = fds::pack_fd_records(&handle.mem.fds);

    let mut ecfs = EcfsFile::default();
    ecfs.prstatus_offset = core_size;
    ecfs.prstatus_size = (handle.notes.thread_count() * PRSTATUS_SIZE) as u64;
    ecfs.fdinfo_offset = ecfs.prstatus_offset + ecfs.prstatus_size;
    ecfs.fdinfo_size = fdinfo.len() as u64;
    ecfs.siginfo_offset = ecfs.fdinfo_offset + ecfs.fdinfo_size;
    ecfs.siginfo_size = SIGINFO_SIZE as u64;
    ecfs.auxv_offset = ecfs.siginfo_offset + ecfs.siginfo_size;
    ecfs.auxv_size = handle.notes.auxv.len() as u64;
    ecfs.exepath_offset = ecfs.auxv_offset + ecfs.auxv_size;
    ecfs.exepath_size = handle.mem.exe_path.len() as u64 + 1;
    ecfs.personality_offset = ecfs.exepath_offset + ecfs.exepath_size;
    ecfs.personality_size = super::PERSONALITY_SIZE as u64;
    ecfs.arglist_offset = ecfs.personality_offset + ecfs.personality_size;
    ecfs.arglist_size = ELF_PRARGSZ as u64;
    // The section table starts 8-aligned past the last payload.
    ecfs.stb_offset = utils::align8(ecfs.arglist_offset + ecfs.arglist_size);

    let mut out = File::create(outfile)?;
    std::fs::set_permissions(outfile, std::fs::Permissions::from_mode(0o770))?;

    // Original body of the (text-merged) core, then the payloads in ledger
    // order.
    out.write_all(handle.core.reader.bytes())?;
    for thread in &handle.notes.threads {
        out.write_all(&thread.raw)?;
    }
    out.write_all(&fdinfo)?;
    match &handle.notes.siginfo {
        Some(raw) => out.write_all(raw)?,
        None => {
            utils::warn("core had no usable NT_SIGINFO, writing zeroes");
            out.write_all(&[0u8; SIGINFO_SIZE])?;
        }
    }
    out.write_all(&handle.notes.auxv)?;
    out.write_all(handle.mem.exe_path.as_bytes())?;
    out.write_all(&[0])?;
    out.write_all(&handle.personality.to_record())?;
    let mut arglist = handle.arglist.clone();
    arglist.resize(ELF_PRARGSZ, 0);
    out.write_all(&arglist)?;
    let pad = ecfs.stb_offset - (ecfs.arglist_offset + ecfs.arglist_size);
    out.write_all(&vec![0u8; pad as usize])?;

    // The headers themselves, then the packed name table right behind them.
    let (shdrs, shstrtab) = build_section_headers(handle, &mut ecfs);
    ecfs.section_count = shdrs.len() as u16;
    let sixty_four_bit = handle.core.reader.sixty_four_bit;
    let little_endian = handle.core.reader.little_endian;
    let mut table = Vec::new();
    for shdr in &shdrs {
        shdr.write_to(&mut table, sixty_four_bit, little_endian);
    }
    out.write_all(&table)?;
    out.write_all(&shstrtab)?;
    out.sync_all()?;
    drop(out);

    patch_header(outfile, handle, &ecfs)?;
    std::fs::set_permissions(outfile, std::fs::Permissions::from_mode(0o777))?;
    Ok(ecfs)
}

fn patch_header(outfile: &Path, handle: &Handle, ecfs: &EcfsFile) -> Result<(), Box<dyn Error>> {
    let file = OpenOptions::new().read(true).write(true).open(outfile)?;
    let mut mem = unsafe { MmapMut::map_mut(&file)? };
    header::patch_output_header(
        &mut mem,
        handle.core.reader.sixty_four_bit,
        handle.core.reader.little_endian,
        handle.layout.o_entry,
        ecfs.stb_offset,
        ecfs.section_count,
        ecfs.section_count - 1,
    )?;
    mem.flush()?;
    Ok(())
}

struct SectionBuilder {
    shdrs: Vec<Shdr>,
    strtab: Vec<u8>,
}

impl SectionBuilder {
    fn new() -> Self {
        SectionBuilder {
            shdrs: Vec::new(),
            strtab: vec![],
        }
    }

    fn add(&mut self, name: &str, mut shdr: Shdr) -> u16 {
        shdr.name = self.strtab.len() as u32;
        self.strtab.extend_from_slice(name.as_bytes());
        self.strtab.push(0);
        self.shdrs.push(shdr);
        (self.shdrs.len() - 1) as u16
    }
}

fn size_or_unknown(size: u64) -> u64 {
    if size > 0 { size } else { UNKNOWN_SHDR_SIZE }
}

fn build_section_headers(handle: &mut Handle, ecfs: &mut EcfsFile) -> (Vec<Shdr>, Vec<u8>) {
    let layout = &handle.layout;
    let smeta = &handle.dynmeta;
    let fb_init = size_or_unknown(handle.fallbacks.init_size);
    let dynamic = handle.personality.is_dynamic();
    let sixty_four_bit = handle.core.reader.sixty_four_bit;
    let word = if sixty_four_bit { 8u64 } else { 4u64 };
    let sym_size = if sixty_four_bit { 24u64 } else { 16u64 };
    let rela_size = if sixty_four_bit { 24u64 } else { 8u64 };

    let mut b = SectionBuilder::new();

    b.add("", Shdr::default());

    if dynamic {
        b.add(
            ".interp",
            Shdr {
                stype: SHT_PROGBITS,
                offset: layout.interp_offset,
                addr: layout.interp_vaddr,
                flags: SHF_ALLOC,
                size: layout.interp_size,
                addralign: 1,
                ..Shdr::default()
            },
        );
    }

    b.add(
        ".note",
        Shdr {
            stype: SHT_NOTE,
            offset: layout.note_offset,
            addr: layout.note_vaddr,
            flags: SHF_ALLOC,
            size: handle.core.note_size,
            addralign: 4,
            ..Shdr::default()
        },
    );

    let mut dynsym_index = 0;
    if dynamic {
        b.add(
            ".hash",
            Shdr {
                stype: SHT_GNU_HASH,
                offset: smeta.hash_offset,
                addr: smeta.hash_vaddr,
                flags: SHF_ALLOC,
                size: size_or_unknown(handle.fallbacks.hash_size),
                addralign: 4,
                ..Shdr::default()
            },
        );

        dynsym_index = b.shdrs.len() as u32;
        b.add(
            ".dynsym",
            Shdr {
                stype: SHT_DYNSYM,
                offset: smeta.dynsym_offset,
                addr: smeta.dynsym_vaddr,
                flags: SHF_ALLOC,
                link: dynsym_index + 1, // .dynstr follows
                entsize: sym_size,
                size: smeta.dynstr_offset.saturating_sub(smeta.dynsym_offset),
                addralign: word,
                ..Shdr::default()
            },
        );

        b.add(
            ".dynstr",
            Shdr {
                stype: SHT_STRTAB,
                offset: smeta.dynstr_offset,
                addr: smeta.dynstr_vaddr,
                flags: SHF_ALLOC,
                size: smeta.dynstr_size,
                addralign: 1,
                ..Shdr::default()
            },
        );

        let (rel_name, rel_type, rel_off, rel_addr) = if sixty_four_bit {
            (".rela.dyn", SHT_RELA, smeta.rela_offset, smeta.rela_vaddr)
        } else {
            (".rel.dyn", SHT_REL, smeta.rel_offset, smeta.rel_vaddr)
        };
        b.add(
            rel_name,
            Shdr {
                stype: rel_type,
                offset: rel_off,
                addr: rel_addr,
                flags: SHF_ALLOC,
                link: dynsym_index,
                entsize: rela_size,
                size: size_or_unknown(handle.fallbacks.rela_size),
                addralign: word,
                ..Shdr::default()
            },
        );

        let (plt_rel_name, plt_rel_off, plt_rel_addr) = if sixty_four_bit {
            (".rela.plt", smeta.plt_rela_offset, smeta.plt_rela_vaddr)
        } else {
            (".rel.plt", smeta.plt_rela_offset, smeta.plt_rela_vaddr)
        };
        b.add(
            plt_rel_name,
            Shdr {
                stype: rel_type,
                offset: plt_rel_off,
                addr: plt_rel_addr,
                flags: SHF_ALLOC,
                link: dynsym_index,
                entsize: rela_size,
                size: size_or_unknown(handle.fallbacks.plt_rela_size),
                addralign: word,
                ..Shdr::default()
            },
        );

        b.add(
            ".init",
            Shdr {
                stype: SHT_PROGBITS,
                offset: smeta.init_offset,
                addr: smeta.init_vaddr,
                flags: SHF_ALLOC | SHF_EXECINSTR,
                size: fb_init,
                addralign: word,
                ..Shdr::default()
            },
        );

        // .plt sits right after .init but is 16-aligned in the address
        // space, which sometimes leaves a gap between the end of .init and
        // the first PLT stub. Mirror that gap in the file offset.
        let init_end = smeta.init_vaddr + fb_init;
        let plt_offset = smeta.init_offset + fb_init + (utils::align16(init_end) - init_end);
        b.add(
            ".plt",
            Shdr {
                stype: SHT_PROGBITS,
                offset: plt_offset,
                addr: handle.fallbacks.plt_vaddr,
                flags: SHF_ALLOC | SHF_EXECINSTR,
                entsize: 16,
                size: size_or_unknown(handle.fallbacks.plt_size),
                addralign: 16,
                ..Shdr::default()
            },
        );
    }

    ecfs.text_shdr_index = b.add(
        ".text",
        Shdr {
            stype: SHT_PROGBITS,
            offset: layout.text_offset,
            addr: layout.text_vaddr,
            flags: SHF_ALLOC | SHF_EXECINSTR,
            size: layout.text_size,
            addralign: 16,
            ..Shdr::default()
        },
    );

    if dynamic {
        b.add(
            ".fini",
            Shdr {
                stype: SHT_PROGBITS,
                offset: smeta.fini_offset,
                addr: smeta.fini_vaddr,
                flags: SHF_ALLOC | SHF_EXECINSTR,
                size: size_or_unknown(handle.fallbacks.fini_size),
                addralign: 16,
                ..Shdr::default()
            },
        );

        b.add(
            ".eh_frame_hdr",
            Shdr {
                stype: SHT_PROGBITS,
                offset: layout.ehframe_offset,
                addr: layout.ehframe_vaddr,
                flags: SHF_ALLOC | SHF_EXECINSTR,
                size: layout.ehframe_size,
                addralign: 4,
                ..Shdr::default()
            },
        );
    }

    // For the dynamically linked case PT_GNU_EH_FRAME points at
    // .eh_frame_hdr, and .eh_frame proper starts right after it. Static
    // binaries have no eh_frame segment at all, so there the offset came out
    // of the original executable's section table.
    let mut ehframe_offset = if dynamic {
        layout.ehframe_offset + layout.ehframe_size
    } else {
        layout.ehframe_offset
    };
    // Known artifact: some cores carry four bytes of zeroes where .eh_frame
    // should begin. Skip them and remember we did.
    if let Ok(0) = get_word(
        handle.core.reader.bytes(),
        ehframe_offset as usize,
        handle.core.reader.little_endian,
    ) {
        ehframe_offset += 4;
        handle.fallbacks.eh_frame_offset_workaround = true;
    }
    let ehsz = (layout.ehframe_vaddr + layout.ehframe_size).saturating_sub(layout.text_vaddr);
    b.add(
        ".eh_frame",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ehframe_offset,
            addr: if dynamic {
                layout.ehframe_vaddr + layout.ehframe_size
            } else {
                handle.fallbacks.ehframe_vaddr
            },
            flags: SHF_ALLOC | SHF_EXECINSTR,
            size: if handle.fallbacks.ehframe_size > 0 {
                handle.fallbacks.ehframe_size
            } else {
                ehsz
            },
            addralign: 8,
            ..Shdr::default()
        },
    );

    if dynamic {
        b.add(
            ".dynamic",
            Shdr {
                stype: SHT_DYNAMIC,
                offset: layout.dyn_offset,
                addr: layout.dyn_vaddr,
                flags: SHF_ALLOC | SHF_WRITE,
                entsize: word * 2,
                size: layout.dyn_size,
                addralign: word,
                ..Shdr::default()
            },
        );

        b.add(
            ".got.plt",
            Shdr {
                stype: SHT_PROGBITS,
                offset: smeta.got_offset,
                addr: smeta.got_vaddr,
                flags: SHF_ALLOC | SHF_WRITE,
                entsize: word,
                size: size_or_unknown(handle.fallbacks.got_size),
                addralign: word,
                ..Shdr::default()
            },
        );
    }

    b.add(
        ".data",
        Shdr {
            stype: SHT_PROGBITS,
            offset: layout.data_offset,
            addr: layout.data_vaddr,
            flags: SHF_ALLOC | SHF_WRITE,
            size: layout.data_size,
            addralign: word,
            ..Shdr::default()
        },
    );

    // .bss and the anonymous regions keep SHT_PROGBITS: the bytes exist in a
    // core and we want tools to show them.
    b.add(
        ".bss",
        Shdr {
            stype: SHT_PROGBITS,
            offset: layout.bss_offset,
            addr: layout.bss_vaddr,
            flags: SHF_ALLOC | SHF_WRITE,
            size: layout.bss_size,
            addralign: word,
            ..Shdr::default()
        },
    );

    b.add(
        ".heap",
        Shdr {
            stype: SHT_PROGBITS,
            offset: super::internal_sh_offset(&handle.core.phdrs, &handle.mem, MappingKind::Heap),
            addr: handle.mem.heap.base,
            flags: SHF_ALLOC | SHF_WRITE,
            size: handle.mem.heap.size,
            addralign: word,
            ..Shdr::default()
        },
    );

    if dynamic {
        add_lib_sections(&mut b, &handle.libs);
    }

    b.add(
        ".prstatus",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ecfs.prstatus_offset,
            entsize: PRSTATUS_SIZE as u64,
            size: ecfs.prstatus_size,
            addralign: 4,
            ..Shdr::default()
        },
    );

    b.add(
        ".fdinfo",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ecfs.fdinfo_offset,
            entsize: fds::FDINFO_RECORD_SIZE as u64,
            size: ecfs.fdinfo_size,
            addralign: 4,
            ..Shdr::default()
        },
    );

    b.add(
        ".siginfo",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ecfs.siginfo_offset,
            entsize: SIGINFO_SIZE as u64,
            size: ecfs.siginfo_size,
            addralign: 4,
            ..Shdr::default()
        },
    );

    b.add(
        ".auxvector",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ecfs.auxv_offset,
            entsize: 8,
            size: ecfs.auxv_size,
            addralign: 8,
            ..Shdr::default()
        },
    );

    b.add(
        ".exepath",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ecfs.exepath_offset,
            entsize: 1,
            size: ecfs.exepath_size,
            addralign: 1,
            ..Shdr::default()
        },
    );

    b.add(
        ".personality",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ecfs.personality_offset,
            entsize: ecfs.personality_size,
            size: ecfs.personality_size,
            addralign: 1,
            ..Shdr::default()
        },
    );

    b.add(
        ".arglist",
        Shdr {
            stype: SHT_PROGBITS,
            offset: ecfs.arglist_offset,
            entsize: 1,
            size: ecfs.arglist_size,
            addralign: 1,
            ..Shdr::default()
        },
    );

    b.add(
        ".stack",
        Shdr {
            stype: SHT_PROGBITS,
            offset: super::internal_sh_offset(&handle.core.phdrs, &handle.mem, MappingKind::Stack),
            addr: handle.mem.stack.base,
            flags: SHF_ALLOC | SHF_WRITE,
            size: handle.mem.stack.size,
            addralign: word,
            ..Shdr::default()
        },
    );

    b.add(
        ".vdso",
        Shdr {
            stype: SHT_PROGBITS,
            offset: super::internal_sh_offset(&handle.core.phdrs, &handle.mem, MappingKind::Vdso),
            addr: handle.mem.vdso.base,
            flags: SHF_ALLOC | SHF_WRITE,
            size: handle.mem.vdso.size,
            addralign: word,
            ..Shdr::default()
        },
    );

    b.add(
        ".vsyscall",
        Shdr {
            stype: SHT_PROGBITS,
            offset: super::internal_sh_offset(
                &handle.core.phdrs,
                &handle.mem,
                MappingKind::Vsyscall,
            ),
            addr: handle.mem.vsyscall.base,
            flags: SHF_ALLOC | SHF_WRITE,
            size: handle.mem.vsyscall.size,
            addralign: word,
            ..Shdr::default()
        },
    );

    // .symtab and .strtab are placeholders: the symbol reconstructor appends
    // their contents after this table is already on disk and patches the
    // offsets and sizes then.
    let symtab_index = b.shdrs.len() as u32;
    b.add(
        ".symtab",
        Shdr {
            stype: SHT_SYMTAB,
            link: symtab_index + 1,
            entsize: sym_size,
            addralign: 4,
            ..Shdr::default()
        },
    );

    b.add(
        ".strtab",
        Shdr {
            stype: SHT_STRTAB,
            addralign: 1,
            ..Shdr::default()
        },
    );

    b.add(
        ".shstrtab",
        Shdr {
            stype: SHT_STRTAB,
            addralign: 1,
            ..Shdr::default()
        },
    );

    // Now that the count is final, the name table's own location is known: it
    // is packed directly behind the header table.
    let shdr_size = if sixty_four_bit { SHDR_SIZE_64 } else { SHDR_SIZE_32 };
    let count = b.shdrs.len();
    let last = b.shdrs.last_mut().unwrap();
    last.offset = ecfs.stb_offset + (shdr_size * count) as u64;
    last.size = b.strtab.len() as u64;

    (b.shdrs, b.strtab)
}

fn add_lib_sections(b: &mut SectionBuilder, libs: &[LibMapping]) {
    // One section per library mapping: libc.so.text, libc.so.data.0,
    // libc.so.relro and so on, roughly three per library.
    let mut data_count = 0;
    for lib in libs {
        use crate::elf::{PF_R, PF_W, PF_X};
        let name = match lib.flags {
            f if f == PF_R | PF_X => format!("{}.text", lib.name),
            f if f == PF_R | PF_W => {
                let n = data_count;
                data_count += 1;
                format!("{}.data.{}", lib.name, n)
            }
            PF_R => format!("{}.relro", lib.name),
            _ => format!("{}.undef", lib.name),
        };
        b.add(
            &name,
            Shdr {
                stype: if lib.injected { SHT_INJECTED } else { SHT_SHLIB },
                offset: lib.offset,
                addr: lib.base,
                flags: SHF_ALLOC,
                size: lib.size,
                addralign: 8,
                ..Shdr::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::notes::{
        NT_AUXV, NT_FILE, NT_PRPSINFO, NT_PRSTATUS, NT_SIGINFO, NoteDesc, PRPSINFO_SIZE,
    };
    use crate::elf::{CoreImage, DynMeta, ElfHeader, PF_R, PF_W, PF_X, Reader};
    use crate::reconstruct::{self, Fallbacks, FuncDesc, Personality};
    use crate::snapshot::{MemDesc, Proto, Region, SocketInfo, maps};
    use crate::utils::fixtures::{
        CoreBuilder, ExeBuilder, PhdrSpec, ShdrSpec, note_entry, write_temp,
    };
    use memmap2::Mmap;
    use std::fs::File;
    use std::path::PathBuf;

    fn prstatus_bytes(pid: i32, signo: i32, fill: u8) -> Vec<u8> {
        let mut raw = vec![fill; PRSTATUS_SIZE];
        raw[0..4].copy_from_slice(&signo.to_le_bytes());
        raw[32..36].copy_from_slice(&pid.to_le_bytes());
        raw
    }

    fn nt_file_bytes(entries: &[(u64, u64, &str)]) -> Vec<u8> {
        let mut desc = Vec::new();
        desc.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        desc.extend_from_slice(&0x1000u64.to_le_bytes());
        for (start, end, _) in entries {
            desc.extend_from_slice(&start.to_le_bytes());
            desc.extend_from_slice(&end.to_le_bytes());
            desc.extend_from_slice(&0u64.to_le_bytes());
        }
        for (_, _, path) in entries {
            desc.extend_from_slice(path.as_bytes());
            desc.push(0);
        }
        desc
    }

    const MAPS_TEXT: &str = "\
00400000-00401000 r-xp 00000000 08:02 1 /usr/bin/app
00600000-00601000 rw-p 00000000 08:02 1 /usr/bin/app
00700000-00702000 rw-p 00000000 00:00 0 [heap]
7f10000000-7f10002000 r-xp 00000000 08:02 2 /lib/libfoo.so
7f10002000-7f10003000 rw-p 00002000 08:02 2 /lib/libfoo.so
7f10003000-7f10004000 r--p 00003000 08:02 2 /lib/libfoo.so
7fff00000000-7fff00002000 rw-p 00000000 00:00 0 [stack]
7fff10000000-7fff10001000 r-xp 00000000 00:00 0 [vdso]
ffffffffff600000-ffffffffff601000 r-xp 00000000 00:00 0 [vsyscall]
";

    // Assembles a full dynamic-executable scenario: core on disk, original
    // exe on disk, MemDesc as the snapshot stage would have produced it, and
    // the cross-reference run for real.
    fn dynamic_handle(tag: &str) -> (Handle, PathBuf, PathBuf) {
        let mut note = Vec::new();
        note.extend(note_entry("CORE", NT_PRSTATUS, &prstatus_bytes(500, 11, 0x51)));
        note.extend(note_entry("CORE", NT_PRSTATUS, &prstatus_bytes(501, 0, 0x52)));
        let mut psinfo = vec![0u8; PRPSINFO_SIZE];
        psinfo[16..20].copy_from_slice(&1000u32.to_le_bytes());
        psinfo[40..43].copy_from_slice(b"app");
        psinfo[56..60].copy_from_slice(b"app\0");
        note.extend(note_entry("CORE", NT_PRPSINFO, &psinfo));
        note.extend(note_entry("CORE", NT_SIGINFO, &[0x33u8; SIGINFO_SIZE]));
        note.extend(note_entry("CORE", NT_AUXV, &[0x44u8; 32]));
        note.extend(note_entry(
            "CORE",
            NT_FILE,
            &nt_file_bytes(&[
                (0x400000, 0x401000, "/usr/bin/app"),
                (0x600000, 0x601000, "/usr/bin/app"),
                (0x7f10000000, 0x7f10002000, "/lib/libfoo.so"),
                (0x7f10002000, 0x7f10003000, "/lib/libfoo.so"),
                (0x7f10003000, 0x7f10004000, "/lib/libfoo.so"),
            ]),
        ));

        let mut builder = CoreBuilder::new();
        builder.note = note;
        builder.add_load(0x400000, 0x1000, 0x1000, PF_R | PF_X); // text (merged)
        builder.add_load(0x600000, 0x1000, 0x1000, PF_R | PF_W); // data
        builder.add_load(0x700000, 0x2000, 0x2000, PF_R | PF_W); // heap
        builder.add_load(0x7f10000000, 0x2000, 0x2000, PF_R | PF_X); // lib text
        builder.add_load(0x7f10002000, 0x1000, 0x1000, PF_R | PF_W); // lib data
        builder.add_load(0x7f10003000, 0x1000, 0x1000, PF_R); // lib relro
        builder.add_load(0x7fff00000000, 0x2000, 0x2000, PF_R | PF_W); // stack
        builder.add_load(0x7fff10000000, 0x1000, 0x1000, PF_R | PF_X); // vdso
        builder.add_load(0xffffffffff600000, 0x1000, 0x1000, PF_R | PF_X); // vsyscall
        let core_path = write_temp(&format!("{tag}_core"), &builder.build());

        let mut exe = ExeBuilder::new(crate::elf::ET_EXEC);
        exe.entry = 0x400100;
        exe.phdrs = vec![
            PhdrSpec {
                ptype: crate::elf::PT_LOAD,
                flags: PF_R | PF_X,
                offset: 0,
                vaddr: 0x400000,
                file_size: 0x800,
                mem_size: 0x800,
            },
            PhdrSpec {
                ptype: crate::elf::PT_LOAD,
                flags: PF_R | PF_W,
                offset: 0x800,
                vaddr: 0x600000,
                file_size: 0x800,
                mem_size: 0xa00,
            },
            PhdrSpec {
                ptype: crate::elf::PT_DYNAMIC,
                flags: PF_R | PF_W,
                offset: 0x900,
                vaddr: 0x600100,
                file_size: 0x150,
                mem_size: 0x150,
            },
            PhdrSpec {
                ptype: crate::elf::PT_GNU_EH_FRAME,
                flags: PF_R,
                offset: 0xe00,
                vaddr: 0x400e00,
                file_size: 0x40,
                mem_size: 0x40,
            },
            PhdrSpec {
                ptype: crate::elf::PT_INTERP,
                flags: PF_R,
                offset: 0x238,
                vaddr: 0x400238,
                file_size: 0x1c,
                mem_size: 0,
            },
        ];
        exe.shdrs = vec![
            ShdrSpec { name: ".gnu.hash", addr: 0x400298, size: 0x24 },
            ShdrSpec { name: ".rela.dyn", addr: 0x400300, size: 0x60 },
            ShdrSpec { name: ".rela.plt", addr: 0x400360, size: 0x30 },
            ShdrSpec { name: ".init", addr: 0x4005a0, size: 0x17 },
            ShdrSpec { name: ".plt", addr: 0x4005c0, size: 0x40 },
            ShdrSpec { name: ".fini", addr: 0x400d00, size: 0x9 },
            ShdrSpec { name: ".got.plt", addr: 0x600300, size: 0x20 },
            ShdrSpec { name: ".eh_frame", addr: 0x400e40, size: 0x100 },
        ];
        let exe_path = write_temp(&format!("{tag}_exe"), &exe.build());

        let mut mem = MemDesc::empty_for_tests();
        mem.comm = "app".to_string();
        mem.exe_path = "/usr/bin/app".to_string();
        mem.maps = maps::parse_maps(MAPS_TEXT, "app").unwrap();
        mem.text = Region { base: 0x400000, size: 0x1000 };
        mem.data = Region { base: 0x600000, size: 0x1000 };
        mem.heap = Region { base: 0x700000, size: 0x2000 };
        mem.stack = Region { base: 0x7fff00000000, size: 0x2000 };
        mem.vdso = Region { base: 0x7fff10000000, size: 0x1000 };
        mem.vsyscall = Region { base: 0xffffffffff600000, size: 0x1000 };
        mem.fds = vec![crate::snapshot::FdInfo {
            fd: 3,
            path: "socket:[8123]".to_string(),
            socket: Some(SocketInfo {
                proto: Proto::Tcp,
                src_addr: 0x0100007F,
                dst_addr: 0x0A000001,
                src_port: 8080,
                dst_port: 443,
            }),
        }];

        let core = CoreImage::load(core_path.clone()).unwrap();
        let notes = NoteDesc::parse(&core).unwrap();
        let exe_file = File::open(&exe_path).unwrap();
        let exe_reader = Reader::new(unsafe { Mmap::map(&exe_file).unwrap() }).unwrap();

        let mut layout = reconstruct::parse_orig_phdrs(&exe_reader, &mem, &notes.files).unwrap();
        let fallbacks = Fallbacks::pull(&exe_reader).unwrap();
        reconstruct::xref_offsets(&core.phdrs, &mut layout, &fallbacks);
        let libs = reconstruct::lookup_lib_maps(&core.phdrs, &mem, &notes.files);
        let personality = reconstruct::build_personality(&exe_reader, &layout, false).unwrap();

        // The dynamic walk is covered by its own tests; hand it plausible
        // values that stay inside the core's segments.
        let text_off = core.offset_for_base(0x400000).unwrap();
        let data_off = core.offset_for_base(0x600000).unwrap();
        let dynmeta = DynMeta {
            hash_vaddr: 0x400298,
            hash_offset: text_off + 0x298,
            dynsym_vaddr: 0x400400,
            dynsym_offset: text_off + 0x400,
            dynstr_vaddr: 0x400460,
            dynstr_offset: text_off + 0x460,
            dynstr_size: 0x80,
            rela_vaddr: 0x400300,
            rela_offset: text_off + 0x300,
            plt_rela_vaddr: 0x400360,
            plt_rela_offset: text_off + 0x360,
            init_vaddr: 0x4005a0,
            init_offset: text_off + 0x5a0,
            fini_vaddr: 0x400d00,
            fini_offset: text_off + 0xd00,
            got_vaddr: 0x600300,
            got_offset: data_off + 0x300,
            plt_rel_size: 0x30,
            ..DynMeta::default()
        };

        let arglist = notes.psinfo.as_ref().unwrap().psargs.clone();
        let handle = Handle {
            core,
            mem,
            notes,
            layout,
            dynmeta,
            fallbacks,
            personality,
            libs,
            arglist,
        };
        (handle, core_path, exe_path)
    }

    struct Output {
        bytes: Vec<u8>,
        names: Vec<String>,
        shdrs: Vec<Shdr>,
    }

    fn read_output(path: &Path) -> Output {
        let bytes = std::fs::read(path).unwrap();
        let file = File::open(path).unwrap();
        let reader = Reader::new(unsafe { Mmap::map(&file).unwrap() }).unwrap();
        let header = ElfHeader::new(&reader).unwrap();
        let entsize = Shdr::entry_size(true);
        let strtab_hdr = Shdr::parse_raw(
            &bytes,
            header.sh_offset as usize + header.string_table_index as usize * entsize,
            true,
            true,
        )
        .unwrap();
        let names_bytes =
            bytes[strtab_hdr.offset as usize..(strtab_hdr.offset + strtab_hdr.size) as usize].to_vec();
        let mut names = Vec::new();
        let mut shdrs = Vec::new();
        for i in 0..header.num_sh_entries as usize {
            let shdr =
                Shdr::parse_raw(&bytes, header.sh_offset as usize + i * entsize, true, true)
                    .unwrap();
            names.push(
                crate::elf::sections::string_at(&names_bytes, shdr.name as usize)
                    .unwrap()
                    .to_string(),
            );
            shdrs.push(shdr);
        }
        Output { bytes, names, shdrs }
    }

    fn section<'a>(out: &'a Output, name: &str) -> &'a Shdr {
        let i = out.names.iter().position(|n| n == name).unwrap();
        &out.shdrs[i]
    }

    #[test]
    fn dynamic_output_has_the_full_section_list() {
        let (mut handle, core_path, exe_path) = dynamic_handle("synth_dyn");
        let out_path = write_temp("synth_dyn_out", b"");
        core2ecfs(&out_path, &mut handle).unwrap();

        let out = read_output(&out_path);
        insta::assert_snapshot!(
            out.names[1..].join(" "),
            @".interp .note .hash .dynsym .dynstr .rela.dyn .rela.plt .init .plt .text .fini .eh_frame_hdr .eh_frame .dynamic .got.plt .data .bss .heap libfoo.so.text libfoo.so.data.0 libfoo.so.relro .prstatus .fdinfo .siginfo .auxvector .exepath .personality .arglist .stack .vdso .vsyscall .symtab .strtab .shstrtab"
        );

        drop(handle);
        for p in [&core_path, &exe_path, &out_path] {
            std::fs::remove_file(p).unwrap();
        }
    }

    #[test]
    fn dynamic_output_invariants() {
        let (mut handle, core_path, exe_path) = dynamic_handle("synth_inv");
        let core_size = handle.core.size();
        let prstatus_raw0 = handle.notes.threads[0].raw.clone();
        let out_path = write_temp("synth_inv_out", b"");
        let ecfs = core2ecfs(&out_path, &mut handle).unwrap();
        reconstruct::build_local_symtab_and_finalize(
            &out_path,
            &ecfs,
            &[
                FuncDesc { addr: 0x400100, size: 0x40 },
                FuncDesc { addr: 0x400200, size: 0x80 },
            ],
        )
        .unwrap();

        let out = read_output(&out_path);

        // The original core bytes come through untouched.
        assert_eq!(&out.bytes[..core_size as usize], handle.core.reader.bytes());

        // ELF header: no longer a core, runtime entry restored, string table
        // index points at the last section.
        let file = File::open(&out_path).unwrap();
        let reader = Reader::new(unsafe { Mmap::map(&file).unwrap() }).unwrap();
        let header = ElfHeader::new(&reader).unwrap();
        assert_eq!(header.etype, crate::elf::ET_NONE);
        assert_eq!(header.entry, 0x400100);
        assert_eq!(header.num_sh_entries as usize, out.shdrs.len());
        assert_eq!(header.string_table_index as usize, out.shdrs.len() - 1);
        assert_eq!(out.names.last().unwrap(), ".shstrtab");

        // Section containment: every section lies inside the file.
        for (name, shdr) in out.names.iter().zip(&out.shdrs) {
            assert!(
                shdr.offset + shdr.size <= out.bytes.len() as u64,
                "{name} runs past the file end ({:x}+{:x} > {:x})",
                shdr.offset,
                shdr.size,
                out.bytes.len()
            );
        }

        // Spot checks against the known layout.
        assert_eq!(section(&out, ".text").addr, 0x400000);
        assert_eq!(out.names[ecfs.text_shdr_index as usize], ".text");
        assert_eq!(section(&out, ".interp").size, 0x1c);
        assert_eq!(section(&out, ".hash").size, 0x24);
        assert_eq!(section(&out, ".dynsym").size, 0x60);
        assert_eq!(section(&out, ".bss").addr, 0x600800);
        assert_eq!(section(&out, ".bss").size, 0x200);
        assert_eq!(section(&out, ".heap").addr, 0x700000);
        assert_eq!(section(&out, "libfoo.so.text").stype, SHT_SHLIB);
        assert_eq!(section(&out, "libfoo.so.text").addr, 0x7f10000000);

        // Payloads round-trip.
        assert_eq!(
            &out.bytes[ecfs.prstatus_offset as usize..ecfs.prstatus_offset as usize + PRSTATUS_SIZE],
            &prstatus_raw0[..]
        );
        let exepath = &out.bytes
            [ecfs.exepath_offset as usize..(ecfs.exepath_offset + ecfs.exepath_size) as usize];
        assert_eq!(exepath, b"/usr/bin/app\0");
        let fdinfo = &out.bytes[ecfs.fdinfo_offset as usize..][..fds::FDINFO_RECORD_SIZE];
        assert_eq!(i32::from_le_bytes(fdinfo[0..4].try_into().unwrap()), 3);

        // Personality: dynamically linked non-PIE with section headers.
        let personality = u32::from_le_bytes(
            out.bytes[ecfs.personality_offset as usize..][..4].try_into().unwrap(),
        );
        assert_eq!(personality, 0);

        // Symbol reconstruction and the GOT resize.
        let symtab = section(&out, ".symtab");
        let syms = reconstruct::parse_syms(
            &out.bytes,
            symtab.offset as usize,
            symtab.size as usize,
            true,
        )
        .unwrap();
        assert_eq!(syms.len(), 2);
        assert_eq!(syms[1].value, 0x400200);
        assert_eq!(syms[1].shndx, ecfs.text_shdr_index);
        let strtab = section(&out, ".strtab");
        let strtab_bytes =
            &out.bytes[strtab.offset as usize..(strtab.offset + strtab.size) as usize];
        assert_eq!(
            crate::elf::sections::string_at(strtab_bytes, syms[0].name as usize),
            Some("sub_400100")
        );
        // .dynsym is 0x60 bytes = four symbols; 3 reserved slots on top.
        assert_eq!(section(&out, ".got.plt").size, (4 + 3) * 8);

        drop(handle);
        for p in [&core_path, &exe_path, &out_path] {
            std::fs::remove_file(p).unwrap();
        }
    }

    #[test]
    fn static_output_drops_dynamic_sections() {
        let (mut handle, core_path, exe_path) = dynamic_handle("synth_static");
        handle.layout.dynlinked = false;
        handle.personality = Personality(crate::reconstruct::ELF_STATIC);
        handle.libs.clear();
        // Static binaries have no PT_GNU_EH_FRAME; the address comes from the
        // original's section table.
        handle.fallbacks.ehframe_vaddr = 0x400e40;
        handle.layout.ehframe_offset = 0;
        handle.layout.ehframe_vaddr = 0;
        handle.layout.ehframe_size = 0;
        reconstruct::xref_offsets(
            &handle.core.phdrs.clone(),
            &mut handle.layout,
            &handle.fallbacks,
        );

        let out_path = write_temp("synth_static_out", b"");
        core2ecfs(&out_path, &mut handle).unwrap();
        let out = read_output(&out_path);
        insta::assert_snapshot!(
            out.names[1..].join(" "),
            @".note .text .eh_frame .data .bss .heap .prstatus .fdinfo .siginfo .auxvector .exepath .personality .arglist .stack .vdso .vsyscall .symtab .strtab .shstrtab"
        );

        let personality_offset = section(&out, ".personality").offset as usize;
        let personality =
            u32::from_le_bytes(out.bytes[personality_offset..][..4].try_into().unwrap());
        assert_eq!(personality, crate::reconstruct::ELF_STATIC);

        drop(handle);
        for p in [&core_path, &exe_path, &out_path] {
            std::fs::remove_file(p).unwrap();
        }
    }
}
