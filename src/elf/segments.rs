//! Program headers. In a core file these describe the dumped address space;
//! the text merger also edits them in place, so alongside the parsed form
//! there is a raw view for patching.
use super::{ElfHeader, Reader, Stream, get_xword, put_xword};
use std::error::Error;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_GNU_EH_FRAME: u32 = 0x6474e550;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

#[derive(Clone)]
pub struct Phdr {
    pub ptype: u32,

    /// Offset to the first byte of the segment.
    pub offset: u64,

    /// Virtual address of the first byte in the segment.
    pub vaddr: u64,

    /// Number of bytes in the segment in the file.
    pub file_size: u64,

    /// Number of bytes in the segment in memory.
    pub mem_size: u64,

    /// Read/Write/Execute flags.
    pub flags: u32,
}

impl Phdr {
    pub fn new(reader: &Reader, offset: usize) -> Result<Self, Box<dyn Error>> {
        // Field sizes and order differ between 32-bit and 64-bit ELF files.
        let mut s = Stream::new(reader, offset);
        if reader.sixty_four_bit {
            let p_type = s.read_word()?;
            let p_flags = s.read_word()?;
            let p_offset = s.read_offset()?;
            let p_vaddr = s.read_addr()?;
            let _p_paddr = s.read_addr()?;
            let p_filesz = s.read_xword()?;
            let p_memsz = s.read_xword()?;
            Ok(Phdr {
                ptype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                file_size: p_filesz,
                mem_size: p_memsz,
            })
        } else {
            let p_type = s.read_word()?;
            let p_offset = s.read_offset()?;
            let p_vaddr = s.read_addr()?;
            let _p_paddr = s.read_addr()?;
            let p_filesz = s.read_word()? as u64;
            let p_memsz = s.read_word()? as u64;
            let p_flags = s.read_word()?;
            Ok(Phdr {
                ptype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                file_size: p_filesz,
                mem_size: p_memsz,
            })
        }
    }

    pub fn parse_table(reader: &Reader, header: &ElfHeader) -> Vec<Phdr> {
        let mut segments = Vec::new();
        let mut offset = header.ph_offset as usize;

        // Even a large core file has a small number of program headers.
        for _ in 0..header.num_ph_entries {
            match Phdr::new(reader, offset) {
                Ok(ph) => segments.push(ph),
                Err(err) => {
                    crate::utils::warn(&format!("failed to read program header at {offset}: {err}"));
                }
            }
            offset += header.ph_entry_size as usize;
        }
        segments
    }

    pub fn executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr && vaddr < self.vaddr + self.mem_size
    }
}

/// Raw view of one program header inside a writable buffer. Only the fields
/// the text merger touches are exposed.
pub struct PhdrSlot<'a> {
    mem: &'a mut [u8],
    base: usize,
    sixty_four_bit: bool,
    little_endian: bool,
}

impl<'a> PhdrSlot<'a> {
    pub fn new(mem: &'a mut [u8], base: usize, sixty_four_bit: bool, little_endian: bool) -> Self {
        PhdrSlot {
            mem,
            base,
            sixty_four_bit,
            little_endian,
        }
    }

    pub fn ptype(&self) -> Result<u32, Box<dyn Error>> {
        super::get_word(self.mem, self.base, self.little_endian)
    }

    pub fn vaddr(&self) -> Result<u64, Box<dyn Error>> {
        let off = if self.sixty_four_bit { 16 } else { 8 };
        self.read_ulong(self.base + off)
    }

    pub fn offset(&self) -> Result<u64, Box<dyn Error>> {
        let off = if self.sixty_four_bit { 8 } else { 4 };
        self.read_ulong(self.base + off)
    }

    pub fn mem_size(&self) -> Result<u64, Box<dyn Error>> {
        let off = if self.sixty_four_bit { 40 } else { 20 };
        self.read_ulong(self.base + off)
    }

    pub fn set_offset(&mut self, value: u64) -> Result<(), Box<dyn Error>> {
        let off = if self.sixty_four_bit { 8 } else { 4 };
        self.write_ulong(self.base + off, value)
    }

    pub fn set_file_size(&mut self, value: u64) -> Result<(), Box<dyn Error>> {
        let off = if self.sixty_four_bit { 32 } else { 16 };
        self.write_ulong(self.base + off, value)
    }

    fn read_ulong(&self, at: usize) -> Result<u64, Box<dyn Error>> {
        if self.sixty_four_bit {
            get_xword(self.mem, at, self.little_endian)
        } else {
            Ok(super::get_word(self.mem, at, self.little_endian)? as u64)
        }
    }

    fn write_ulong(&mut self, at: usize, value: u64) -> Result<(), Box<dyn Error>> {
        if self.sixty_four_bit {
            put_xword(self.mem, at, value, self.little_endian)
        } else {
            super::put_word(self.mem, at, value as u32, self.little_endian)
        }
    }
}
