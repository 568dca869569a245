//! Rebuilds a local symbol table for the main executable. Stripped binaries
//! still carry .eh_frame, and its FDEs describe the address and extent of
//! every function, so the unwinder's function table is enough to synthesize
//! one sub_<addr> symbol per function. This is the biggest part of the draw
//! of the format: a stripped crash dump comes out with usable symbols.
use super::EcfsFile;
use crate::elf::io::{get_half, get_word, get_xword};
use crate::elf::sections::{Shdr, ShdrSlot, string_at};
use crate::utils;
use memmap2::MmapMut;
use std::error::Error;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// One function recovered from the exception-frame data. Supplied by the CFI
/// unwinding collaborator.
#[derive(Clone, Copy)]
pub struct FuncDesc {
    pub addr: u64,
    pub size: u64,
}

const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;

/// Appends the synthesized .symtab/.strtab contents to the output and patches
/// their headers, then resizes .got.plt now that the dynamic symbol count is
/// knowable. This is the last pass; the file is final after it.
pub fn build_local_symtab_and_finalize(
    outfile: &Path,
    ecfs: &EcfsFile,
    funcs: &[FuncDesc],
) -> Result<(), Box<dyn Error>> {
    let mut file = OpenOptions::new().read(true).write(true).open(outfile)?;

    let mut ident = [0u8; 6];
    use std::os::unix::fs::FileExt;
    file.read_exact_at(&mut ident, 0)?;
    let sixty_four_bit = ident[4] == 2;
    let little_endian = ident[5] == 1;
    let sym_size = if sixty_four_bit { 24usize } else { 16 };
    let word = if sixty_four_bit { 8u64 } else { 4 };

    let mut symtab = Vec::with_capacity(funcs.len() * sym_size);
    let mut strtab = Vec::new();
    for func in funcs {
        let name_offset = strtab.len() as u32;
        strtab.extend_from_slice(format!("sub_{:x}", func.addr).as_bytes());
        strtab.push(0);
        write_sym(
            &mut symtab,
            sixty_four_bit,
            little_endian,
            name_offset,
            (STB_GLOBAL << 4) | (STT_FUNC & 0xf),
            ecfs.text_shdr_index,
            func.addr,
            func.size,
        );
    }

    // Both tables go after everything already in the file.
    let symtab_offset = file.seek(SeekFrom::End(0))?;
    file.write_all(&symtab)?;
    let strtab_offset = symtab_offset + symtab.len() as u64;
    file.write_all(&strtab)?;
    file.sync_all()?;

    let mut mem = unsafe { MmapMut::map_mut(&file)? };
    let entsize = Shdr::entry_size(sixty_four_bit);
    let table = ecfs.stb_offset as usize;
    let count = ecfs.section_count as usize;

    // Section names live in the last section per the synthesizer's layout.
    let shstr = Shdr::parse_raw(
        &mem,
        table + (count - 1) * entsize,
        sixty_four_bit,
        little_endian,
    )?;
    let names = mem
        .get(shstr.offset as usize..(shstr.offset + shstr.size) as usize)
        .ok_or("section string table is out of bounds")?
        .to_vec();

    let mut dynsym_count = 0u64;
    let mut got_plt_base = None;
    for i in 0..count {
        let base = table + i * entsize;
        let shdr = Shdr::parse_raw(&mem, base, sixty_four_bit, little_endian)?;
        match string_at(&names, shdr.name as usize) {
            Some(".symtab") => {
                let mut slot = ShdrSlot::new(&mut mem, base, sixty_four_bit, little_endian);
                slot.set_offset(symtab_offset)?;
                slot.set_size(symtab.len() as u64)?;
            }
            Some(".strtab") => {
                let mut slot = ShdrSlot::new(&mut mem, base, sixty_four_bit, little_endian);
                slot.set_offset(strtab_offset)?;
                slot.set_size(strtab.len() as u64)?;
            }
            Some(".dynsym") => dynsym_count = shdr.size / sym_size as u64,
            Some(".got.plt") => got_plt_base = Some(base),
            _ => (),
        }
    }

    // The GOT holds one slot per dynamic symbol plus the three reserved
    // entries at the front.
    if let Some(base) = got_plt_base {
        let mut slot = ShdrSlot::new(&mut mem, base, sixty_four_bit, little_endian);
        slot.set_size((dynsym_count + 3) * word)?;
    }

    mem.flush()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_sym(
    out: &mut Vec<u8>,
    sixty_four_bit: bool,
    little_endian: bool,
    name: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
) {
    fn bytes(v: u32, le: bool) -> [u8; 4] {
        if le { v.to_le_bytes() } else { v.to_be_bytes() }
    }
    if sixty_four_bit {
        out.extend_from_slice(&bytes(name, little_endian));
        out.push(info);
        out.push(0); // st_other
        out.extend_from_slice(&if little_endian {
            shndx.to_le_bytes()
        } else {
            shndx.to_be_bytes()
        });
        out.extend_from_slice(&if little_endian {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        });
        out.extend_from_slice(&if little_endian {
            size.to_le_bytes()
        } else {
            size.to_be_bytes()
        });
    } else {
        out.extend_from_slice(&bytes(name, little_endian));
        out.extend_from_slice(&bytes(value as u32, little_endian));
        out.extend_from_slice(&bytes(size as u32, little_endian));
        out.push(info);
        out.push(0);
        out.extend_from_slice(&if little_endian {
            shndx.to_le_bytes()
        } else {
            shndx.to_be_bytes()
        });
    }
}

/// Parsed 64-bit symbol, test and report helper.
pub struct Sym {
    pub name: u32,
    pub info: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

pub fn parse_syms(
    bytes: &[u8],
    offset: usize,
    size: usize,
    little_endian: bool,
) -> Result<Vec<Sym>, Box<dyn Error>> {
    let mut syms = Vec::new();
    let mut at = offset;
    while at + 24 <= offset + size {
        syms.push(Sym {
            name: get_word(bytes, at, little_endian)?,
            info: *bytes.get(at + 4).ok_or("symbol out of bounds")?,
            shndx: get_half(bytes, at + 6, little_endian)?,
            value: get_xword(bytes, at + 8, little_endian)?,
            size: get_xword(bytes, at + 16, little_endian)?,
        });
        at += 24;
    }
    utils::require(syms.len() * 24 == size, "ragged symbol table")?;
    Ok(syms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::sections::{SHT_DYNSYM, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB};
    use crate::utils::fixtures::write_temp;

    // A hand-made "output" file: ELF ident, then a section table with just
    // the sections the finalize pass touches, then the name table.
    fn fake_output() -> (Vec<u8>, EcfsFile) {
        let names = b"\0.symtab\0.strtab\0.dynsym\0.got.plt\0.shstrtab\0";
        let table_offset = 64u64;
        let count = 6usize;
        let names_offset = table_offset + (count * 64) as u64;

        let mut mem = vec![0u8; 64];
        mem[0..4].copy_from_slice(&[0x7f, 0x45, 0x4c, 0x46]);
        mem[4] = 2;
        mem[5] = 1;

        let mk = |name: u32, stype: u32, size: u64| Shdr {
            name,
            stype,
            size,
            ..Shdr::default()
        };
        let shdrs = vec![
            mk(0, 0, 0),
            mk(1, SHT_SYMTAB, 0),
            mk(9, SHT_STRTAB, 0),
            mk(17, SHT_DYNSYM, 5 * 24), // five dynamic symbols
            mk(25, SHT_PROGBITS, 0),    // .got.plt
            mk(34, SHT_STRTAB, names.len() as u64),
        ];
        let mut shdrs_with_offsets = shdrs;
        shdrs_with_offsets[5].offset = names_offset;
        for shdr in &shdrs_with_offsets {
            shdr.write_to(&mut mem, true, true);
        }
        mem.extend_from_slice(names);

        let ecfs = EcfsFile {
            stb_offset: table_offset,
            section_count: count as u16,
            text_shdr_index: 9,
            ..EcfsFile::default()
        };
        (mem, ecfs)
    }

    #[test]
    fn synthesizes_symbols_and_resizes_got() {
        let (bytes, ecfs) = fake_output();
        let path = write_temp("symtab_finalize", &bytes);
        let funcs = vec![
            FuncDesc {
                addr: 0x400100,
                size: 0x40,
            },
            FuncDesc {
                addr: 0x400a40,
                size: 0x123,
            },
        ];
        build_local_symtab_and_finalize(&path, &ecfs, &funcs).unwrap();

        let out = std::fs::read(&path).unwrap();
        let symtab_hdr = Shdr::parse_raw(&out, 64 + 64, true, true).unwrap();
        let strtab_hdr = Shdr::parse_raw(&out, 64 + 2 * 64, true, true).unwrap();
        assert_eq!(symtab_hdr.offset, bytes.len() as u64);
        assert_eq!(symtab_hdr.size, 2 * 24);
        assert_eq!(strtab_hdr.offset, symtab_hdr.offset + symtab_hdr.size);

        let syms = parse_syms(
            &out,
            symtab_hdr.offset as usize,
            symtab_hdr.size as usize,
            true,
        )
        .unwrap();
        assert_eq!(syms.len(), 2);
        assert_eq!(syms[0].value, 0x400100);
        assert_eq!(syms[0].size, 0x40);
        assert_eq!(syms[0].info, 0x12); // GLOBAL | FUNC
        assert_eq!(syms[0].shndx, 9);

        let strtab =
            &out[strtab_hdr.offset as usize..(strtab_hdr.offset + strtab_hdr.size) as usize];
        assert_eq!(string_at(strtab, syms[0].name as usize), Some("sub_400100"));
        assert_eq!(string_at(strtab, syms[1].name as usize), Some("sub_400a40"));

        // (5 dynamic symbols + 3 reserved slots) * 8.
        let got_hdr = Shdr::parse_raw(&out, 64 + 4 * 64, true, true).unwrap();
        assert_eq!(got_hdr.size, 8 * 8);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn empty_function_table_is_still_valid() {
        let (bytes, ecfs) = fake_output();
        let path = write_temp("symtab_empty", &bytes);
        build_local_symtab_and_finalize(&path, &ecfs, &[]).unwrap();
        let out = std::fs::read(&path).unwrap();
        let symtab_hdr = Shdr::parse_raw(&out, 64 + 64, true, true).unwrap();
        assert_eq!(symtab_hdr.size, 0);
        assert_eq!(symtab_hdr.offset, bytes.len() as u64);
        std::fs::remove_file(path).unwrap();
    }
}
