//! Walks the runtime dynamic-tag table inside the core to recover where the
//! dynamic linker's metadata lives. The core has no section headers, so these
//! tags are the only authoritative source for symbol/relocation/hash/PLT
//! locations.
use super::{CoreImage, Stream};
use std::error::Error;

pub const DT_PLTRELSZ: i64 = 2;
pub const DT_PLTGOT: i64 = 3;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_STRSZ: i64 = 10;
pub const DT_INIT: i64 = 12;
pub const DT_FINI: i64 = 13;
pub const DT_REL: i64 = 17;
pub const DT_JMPREL: i64 = 23;
pub const DT_GNU_HASH: i64 = 0x6ffffef5;

/// Addresses the dynamic walk needs from the cross-reference stage.
pub struct DynContext {
    pub text_vaddr: u64,
    pub text_offset: u64,
    pub data_vaddr: u64,
    pub data_offset: u64,
    pub dyn_vaddr: u64,
    pub pie: bool,
}

/// Virtual-address/file-offset pairs for the sections recovered from the
/// dynamic segment. Zero means the tag was absent.
#[derive(Default)]
pub struct DynMeta {
    pub rel_vaddr: u64,
    pub rel_offset: u64,
    pub rela_vaddr: u64,
    pub rela_offset: u64,
    pub plt_rela_vaddr: u64,
    pub plt_rela_offset: u64,
    pub got_vaddr: u64,
    pub got_offset: u64,
    pub hash_vaddr: u64,
    pub hash_offset: u64,
    pub init_vaddr: u64,
    pub init_offset: u64,
    pub fini_vaddr: u64,
    pub fini_offset: u64,
    pub dynsym_vaddr: u64,
    pub dynsym_offset: u64,
    pub dynstr_vaddr: u64,
    pub dynstr_offset: u64,
    pub dynstr_size: u64,
    pub plt_rel_size: u64,
}

impl DynMeta {
    pub fn parse(core: &CoreImage, ctx: &DynContext) -> Result<Self, Box<dyn Error>> {
        // The dynamic array lives in the data segment; map its vaddr through
        // the LOAD based exactly at the data segment to a file offset.
        let data_phdr = core
            .phdrs
            .iter()
            .find(|ph| ph.ptype == super::PT_LOAD && ph.vaddr == ctx.data_vaddr)
            .ok_or("unable to find dynamic segment in core file")?;
        let dyn_offset = data_phdr.offset + (ctx.dyn_vaddr - ctx.data_vaddr);

        let mut meta = DynMeta::default();
        let mut s = Stream::new(&core.reader, dyn_offset as usize);
        let text_rel = |val: u64| ctx.text_offset + val - ctx.text_vaddr;
        loop {
            let tag = s.read_ulong()? as i64;
            let val = s.read_ulong()?;
            match tag {
                0 => break, // DT_NULL
                DT_REL => {
                    meta.rel_vaddr = val;
                    meta.rel_offset = text_rel(val);
                }
                DT_RELA => {
                    meta.rela_vaddr = val;
                    meta.rela_offset = text_rel(val);
                }
                DT_JMPREL => {
                    meta.plt_rela_vaddr = val;
                    meta.plt_rela_offset = text_rel(val);
                }
                DT_PLTGOT => {
                    meta.got_vaddr = val;
                    meta.got_offset = (val - ctx.data_vaddr) + ctx.data_offset;
                }
                DT_GNU_HASH => {
                    meta.hash_vaddr = val;
                    meta.hash_offset = text_rel(val);
                }
                DT_INIT => {
                    meta.init_vaddr = val + if ctx.pie { ctx.text_vaddr } else { 0 };
                    meta.init_offset = text_rel(meta.init_vaddr);
                }
                DT_FINI => {
                    meta.fini_vaddr = val + if ctx.pie { ctx.text_vaddr } else { 0 };
                    meta.fini_offset = text_rel(meta.fini_vaddr);
                }
                DT_STRSZ => meta.dynstr_size = val,
                DT_PLTRELSZ => meta.plt_rel_size = val,
                DT_SYMTAB => {
                    meta.dynsym_vaddr = val;
                    meta.dynsym_offset = text_rel(val);
                }
                DT_STRTAB => {
                    meta.dynstr_vaddr = val;
                    meta.dynstr_offset = text_rel(val);
                }
                _ => (),
            }
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fixtures::{CoreBuilder, write_temp};

    fn dyn_entry(tag: i64, val: u64) -> [u8; 16] {
        let mut v = [0u8; 16];
        v[..8].copy_from_slice(&(tag as u64).to_le_bytes());
        v[8..].copy_from_slice(&val.to_le_bytes());
        v
    }

    #[test]
    fn recovers_section_locations() {
        let mut builder = CoreBuilder::new();
        builder.add_load(0x400000, 0x2000, 0x2000, 0x5); // text
        builder.add_load(0x600000, 0x1000, 0x1000, 0x6); // data, holds .dynamic
        let mut image = builder.build();

        // Place the dynamic array 0x100 bytes into the data segment.
        let path = write_temp("dynamic_locate", &image);
        let core = CoreImage::load(path.clone()).unwrap();
        let data_off = core.offset_for_base(0x600000).unwrap() as usize;
        let text_off = core.offset_for_base(0x400000).unwrap();
        drop(core);

        let mut dyn_bytes = Vec::new();
        dyn_bytes.extend_from_slice(&dyn_entry(DT_SYMTAB, 0x400400));
        dyn_bytes.extend_from_slice(&dyn_entry(DT_STRTAB, 0x400800));
        dyn_bytes.extend_from_slice(&dyn_entry(DT_STRSZ, 0x123));
        dyn_bytes.extend_from_slice(&dyn_entry(DT_PLTGOT, 0x600300));
        dyn_bytes.extend_from_slice(&dyn_entry(DT_INIT, 0x200));
        dyn_bytes.extend_from_slice(&dyn_entry(DT_PLTRELSZ, 0x60));
        dyn_bytes.extend_from_slice(&dyn_entry(0, 0));
        image[data_off + 0x100..data_off + 0x100 + dyn_bytes.len()].copy_from_slice(&dyn_bytes);
        std::fs::write(&path, &image).unwrap();

        let core = CoreImage::load(path.clone()).unwrap();
        let ctx = DynContext {
            text_vaddr: 0x400000,
            text_offset: text_off,
            data_vaddr: 0x600000,
            data_offset: data_off as u64,
            dyn_vaddr: 0x600100,
            pie: true,
        };
        let meta = DynMeta::parse(&core, &ctx).unwrap();
        assert_eq!(meta.dynsym_vaddr, 0x400400);
        assert_eq!(meta.dynsym_offset, text_off + 0x400);
        assert_eq!(meta.dynstr_offset, text_off + 0x800);
        assert_eq!(meta.dynstr_size, 0x123);
        assert_eq!(meta.got_vaddr, 0x600300);
        assert_eq!(meta.got_offset, data_off as u64 + 0x300);
        // PIE: DT_INIT holds a text-relative value that gets rebased.
        assert_eq!(meta.init_vaddr, 0x400200);
        assert_eq!(meta.init_offset, text_off + 0x200);
        assert_eq!(meta.plt_rel_size, 0x60);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_data_segment_is_an_error() {
        let mut builder = CoreBuilder::new();
        builder.add_load(0x400000, 0x1000, 0x1000, 0x5);
        let path = write_temp("dynamic_missing", &builder.build());
        let core = CoreImage::load(path.clone()).unwrap();
        let ctx = DynContext {
            text_vaddr: 0x400000,
            text_offset: 0x1000,
            data_vaddr: 0x600000,
            data_offset: 0,
            dyn_vaddr: 0x600100,
            pie: false,
        };
        assert!(DynMeta::parse(&core, &ctx).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
