//! The ELF file header. We parse it for every image we touch (core, original
//! executable, output) and patch it once at the end to graft the synthesized
//! section table onto the output.
use super::{Reader, Stream, put_half, put_xword};
use std::error::Error;

pub const ET_NONE: u16 = 0;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

pub struct ElfHeader {
    pub etype: u16,
    pub machine: u16,
    pub entry: u64,
    pub ph_offset: u64,
    pub sh_offset: u64,
    pub ph_entry_size: u16,
    pub num_ph_entries: u16,
    pub sh_entry_size: u16,
    pub num_sh_entries: u16,
    pub string_table_index: u16,
}

impl ElfHeader {
    pub fn new(reader: &Reader) -> Result<Self, Box<dyn Error>> {
        let mut s = Stream::new(reader, 16);
        let etype = s.read_half()?;
        let machine = s.read_half()?;
        let _version = s.read_word()?;
        let entry = s.read_addr()?;
        let ph_offset = s.read_offset()?;
        let sh_offset = s.read_offset()?;
        let _flags = s.read_word()?;
        let _ehsize = s.read_half()?;
        let ph_entry_size = s.read_half()?;
        let num_ph_entries = s.read_half()?;
        let sh_entry_size = s.read_half()?;
        let num_sh_entries = s.read_half()?;
        let string_table_index = s.read_half()?;
        Ok(ElfHeader {
            etype,
            machine,
            entry,
            ph_offset,
            sh_offset,
            ph_entry_size,
            num_ph_entries,
            sh_entry_size,
            num_sh_entries,
            string_table_index,
        })
    }
}

/// Rewrite the output header in place: the file stops being a core
/// (e_type = ET_NONE), gets the runtime entry point back, and points at the
/// synthesized section-header table.
pub fn patch_output_header(
    mem: &mut [u8],
    sixty_four_bit: bool,
    little_endian: bool,
    entry: u64,
    sh_offset: u64,
    sh_num: u16,
    shstrndx: u16,
) -> Result<(), Box<dyn Error>> {
    // Field offsets differ between the two ELF classes,
    // see https://en.wikipedia.org/wiki/Executable_and_Linkable_Format
    put_half(mem, 16, ET_NONE, little_endian)?;
    if sixty_four_bit {
        put_xword(mem, 24, entry, little_endian)?;
        put_xword(mem, 40, sh_offset, little_endian)?;
        put_half(mem, 58, 64, little_endian)?; // e_shentsize
        put_half(mem, 60, sh_num, little_endian)?;
        put_half(mem, 62, shstrndx, little_endian)?;
    } else {
        super::put_word(mem, 24, entry as u32, little_endian)?;
        super::put_word(mem, 32, sh_offset as u32, little_endian)?;
        put_half(mem, 46, 40, little_endian)?; // e_shentsize
        put_half(mem, 48, sh_num, little_endian)?;
        put_half(mem, 50, shstrndx, little_endian)?;
    }
    Ok(())
}
