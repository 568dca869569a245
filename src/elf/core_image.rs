//! The on-disk core file. The image is immutable once loaded; the text merger
//! rewrites the backing file and then calls reload() to get a fresh value, so
//! nothing ever reads through a mapping whose file has changed underneath it.
use super::{ET_CORE, ElfHeader, PT_NOTE, Phdr, Reader};
use memmap2::Mmap;
use std::error::Error;
use std::fs::File;
use std::path::PathBuf;

pub struct CoreImage {
    pub path: PathBuf,
    pub reader: Reader,
    pub header: ElfHeader,
    pub phdrs: Vec<Phdr>,
    pub note_offset: u64,
    pub note_size: u64,

    /// Sizes of the text segment as cached from the phdr following PT_NOTE.
    /// That phdr is NOT the text segment for PIE executables, so these are
    /// provisional until the cross-reference stage re-resolves them with the
    /// runtime base as a hint.
    pub text_filesz: u64,
    pub text_memsz: u64,
}

impl CoreImage {
    pub fn load(path: PathBuf) -> Result<Self, Box<dyn Error>> {
        // This is unsafe because it has undefined behavior if the underlying
        // file is modified while the memory map is in use. The merge passes
        // never write through a live CoreImage, see reload().
        let file = File::open(&path)?;
        let bytes = unsafe { Mmap::map(&file) }?;
        let reader = Reader::new(bytes)?;
        let header = ElfHeader::new(&reader)?;
        crate::utils::require(
            header.etype == ET_CORE,
            &format!("{} is not an ELF core file", path.display()),
        )?;
        let phdrs = Phdr::parse_table(&reader, &header);

        let note_index = phdrs
            .iter()
            .position(|ph| ph.ptype == PT_NOTE)
            .ok_or("core file has no PT_NOTE segment")?;
        let (text_filesz, text_memsz) = match phdrs.get(note_index + 1) {
            Some(ph) => (ph.file_size, ph.mem_size),
            None => (0, 0),
        };

        Ok(CoreImage {
            path,
            note_offset: phdrs[note_index].offset,
            note_size: phdrs[note_index].file_size,
            text_filesz,
            text_memsz,
            reader,
            header,
            phdrs,
        })
    }

    /// Tears this image down and maps the (possibly rewritten) file again.
    pub fn reload(self) -> Result<Self, Box<dyn Error>> {
        let path = self.path.clone();
        drop(self);
        CoreImage::load(path)
    }

    pub fn size(&self) -> u64 {
        self.reader.len() as u64
    }

    /// The LOAD segment whose address range contains vaddr.
    pub fn find_load_containing(&self, vaddr: u64) -> Option<&Phdr> {
        self.phdrs
            .iter()
            .find(|ph| ph.ptype == super::PT_LOAD && ph.contains(vaddr))
    }

    /// File offset of the LOAD segment based exactly at vaddr.
    pub fn offset_for_base(&self, vaddr: u64) -> Option<u64> {
        self.phdrs
            .iter()
            .find(|ph| ph.vaddr == vaddr)
            .map(|ph| ph.offset)
    }
}
