//! Byte-level access to memory mapped ELF images. Everything returns a Result
//! because core files are sometimes corrupted (typically truncated) and we
//! want to keep working as well as we can when that happens.
use memmap2::Mmap;
use std::error::Error;

pub struct Reader {
    pub little_endian: bool,
    pub sixty_four_bit: bool,
    bytes: Mmap,
}

impl Reader {
    pub fn new(bytes: Mmap) -> Result<Self, Box<dyn Error>> {
        // see https://en.wikipedia.org/wiki/Executable_and_Linkable_Format
        crate::utils::require(bytes.len() > 64, "ELF file is much too small")?;
        let magic = bytes.get(0..4).unwrap();
        crate::utils::require(
            magic[0] == 0x7f && magic[1] == 0x45 && magic[2] == 0x4c && magic[3] == 0x46,
            "not an ELF file (bad magic)",
        )?;

        let ei_class = *bytes.get(0x04).unwrap();
        let ei_data = *bytes.get(0x05).unwrap();
        let ei_version = *bytes.get(0x06).unwrap();
        crate::utils::require(ei_version == 1, &format!("bad elf version: {ei_version}"))?;

        Ok(Reader {
            bytes,
            sixty_four_bit: ei_class == 2,
            little_endian: ei_data == 1,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn slice(&self, offset: usize, size: usize) -> Result<&[u8], Box<dyn Error>> {
        if offset + size > self.bytes.len() {
            return Err("slice out of bounds".into());
        }
        Ok(&self.bytes[offset..offset + size])
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8, Box<dyn Error>> {
        self.bytes
            .get(offset)
            .ok_or("couldn't read byte at offset".into())
            .copied()
    }

    pub fn read_half(&self, offset: usize) -> Result<u16, Box<dyn Error>> {
        let slice = self.slice(offset, 2)?;
        if self.little_endian {
            Ok(u16::from_le_bytes(slice.try_into()?))
        } else {
            Ok(u16::from_be_bytes(slice.try_into()?))
        }
    }

    pub fn read_word(&self, offset: usize) -> Result<u32, Box<dyn Error>> {
        let slice = self.slice(offset, 4)?;
        if self.little_endian {
            Ok(u32::from_le_bytes(slice.try_into()?))
        } else {
            Ok(u32::from_be_bytes(slice.try_into()?))
        }
    }

    pub fn read_xword(&self, offset: usize) -> Result<u64, Box<dyn Error>> {
        let slice = self.slice(offset, 8)?;
        if self.little_endian {
            Ok(u64::from_le_bytes(slice.try_into()?))
        } else {
            Ok(u64::from_be_bytes(slice.try_into()?))
        }
    }

    /// Read either a u32 or u64 word depending on whether the file is 64-bit.
    /// But, for sanity, always return the result as 64 bits.
    pub fn read_addr(&self, offset: usize) -> Result<u64, Box<dyn Error>> {
        if self.sixty_four_bit {
            self.read_xword(offset)
        } else {
            Ok(self.read_word(offset)? as u64)
        }
    }
}

pub struct Stream<'a> {
    pub reader: &'a Reader,
    pub offset: usize,
}

impl<'a> Stream<'a> {
    pub fn new(reader: &'a Reader, offset: usize) -> Self {
        Stream { reader, offset }
    }

    pub fn read_byte(&mut self) -> Result<u8, Box<dyn Error>> {
        let byte = self.reader.read_byte(self.offset)?;
        self.offset += 1;
        Ok(byte)
    }

    pub fn read_half(&mut self) -> Result<u16, Box<dyn Error>> {
        let half = self.reader.read_half(self.offset)?;
        self.offset += 2;
        Ok(half)
    }

    pub fn read_word(&mut self) -> Result<u32, Box<dyn Error>> {
        let word = self.reader.read_word(self.offset)?;
        self.offset += 4;
        Ok(word)
    }

    pub fn read_xword(&mut self) -> Result<u64, Box<dyn Error>> {
        let xword = self.reader.read_xword(self.offset)?;
        self.offset += 8;
        Ok(xword)
    }

    pub fn read_int(&mut self) -> Result<i32, Box<dyn Error>> {
        Ok(self.read_word()? as i32)
    }

    /// Corresponds to the kernel's user_long_t which is 64 or 32 bits.
    pub fn read_ulong(&mut self) -> Result<u64, Box<dyn Error>> {
        if self.reader.sixty_four_bit {
            self.read_xword()
        } else {
            Ok(self.read_word()? as u64)
        }
    }

    pub fn read_addr(&mut self) -> Result<u64, Box<dyn Error>> {
        self.read_ulong()
    }

    pub fn read_offset(&mut self) -> Result<u64, Box<dyn Error>> {
        self.read_ulong()
    }

    /// Read a null-terminated ASCII string.
    pub fn read_string(&mut self) -> Result<String, Box<dyn Error>> {
        let mut s = String::new();
        loop {
            // Kernel documents these as ASCII.
            let byte = self.read_byte()?;
            if byte == 0 {
                break;
            }
            s.push(byte as char);
        }
        Ok(s)
    }
}

// In-place patch helpers. The reconstruction passes edit program and section
// headers inside writable maps of files we have already validated, so these
// operate on plain byte slices rather than a Reader.

pub fn get_half(bytes: &[u8], offset: usize, little_endian: bool) -> Result<u16, Box<dyn Error>> {
    let slice = bytes
        .get(offset..offset + 2)
        .ok_or("half read out of bounds")?;
    if little_endian {
        Ok(u16::from_le_bytes(slice.try_into()?))
    } else {
        Ok(u16::from_be_bytes(slice.try_into()?))
    }
}

pub fn get_word(bytes: &[u8], offset: usize, little_endian: bool) -> Result<u32, Box<dyn Error>> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or("word read out of bounds")?;
    if little_endian {
        Ok(u32::from_le_bytes(slice.try_into()?))
    } else {
        Ok(u32::from_be_bytes(slice.try_into()?))
    }
}

pub fn get_xword(bytes: &[u8], offset: usize, little_endian: bool) -> Result<u64, Box<dyn Error>> {
    let slice = bytes
        .get(offset..offset + 8)
        .ok_or("xword read out of bounds")?;
    if little_endian {
        Ok(u64::from_le_bytes(slice.try_into()?))
    } else {
        Ok(u64::from_be_bytes(slice.try_into()?))
    }
}

pub fn put_half(
    bytes: &mut [u8],
    offset: usize,
    value: u16,
    little_endian: bool,
) -> Result<(), Box<dyn Error>> {
    let slice = bytes
        .get_mut(offset..offset + 2)
        .ok_or("half write out of bounds")?;
    slice.copy_from_slice(&if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    });
    Ok(())
}

pub fn put_word(
    bytes: &mut [u8],
    offset: usize,
    value: u32,
    little_endian: bool,
) -> Result<(), Box<dyn Error>> {
    let slice = bytes
        .get_mut(offset..offset + 4)
        .ok_or("word write out of bounds")?;
    slice.copy_from_slice(&if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    });
    Ok(())
}

pub fn put_xword(
    bytes: &mut [u8],
    offset: usize,
    value: u64,
    little_endian: bool,
) -> Result<(), Box<dyn Error>> {
    let slice = bytes
        .get_mut(offset..offset + 8)
        .ok_or("xword write out of bounds")?;
    slice.copy_from_slice(&if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    });
    Ok(())
}
