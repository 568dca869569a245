//! Verbose summary of the finished output: one row per synthesized section.
use crate::elf::sections::{Shdr, string_at};
use crate::elf::{ElfHeader, Reader};
use std::error::Error;
use std::fs::File;
use std::path::Path;
use tabled::{
    builder::Builder,
    settings::{Alignment, Padding, Style, object::Columns},
};

/// Prints a readelf-ish section table for the ECFS file at path. They look
/// like this:
///
///   name        type  addr          offset  size
///   ----        ----  ----          ------  ----
///   .interp        1  400238        1238    1c
///   .note          7  0             200     d6c
pub fn print_section_summary(path: &Path) -> Result<(), Box<dyn Error>> {
    let file = File::open(path)?;
    let bytes = unsafe { memmap2::Mmap::map(&file)? };
    let reader = Reader::new(bytes)?;
    let header = ElfHeader::new(&reader)?;

    let entsize = Shdr::entry_size(reader.sixty_four_bit);
    let strtab_hdr = Shdr::parse_raw(
        reader.bytes(),
        header.sh_offset as usize + header.string_table_index as usize * entsize,
        reader.sixty_four_bit,
        reader.little_endian,
    )?;
    let names = reader.slice(strtab_hdr.offset as usize, strtab_hdr.size as usize)?;

    let headers = ["name", "type", "addr", "offset", "size"];
    let dashes: Vec<String> = headers.iter().map(|s| "-".repeat(s.len())).collect();
    let mut builder = Builder::with_capacity(header.num_sh_entries as usize + 2, headers.len());
    builder.push_record(headers);
    builder.push_record(&dashes);

    for i in 0..header.num_sh_entries as usize {
        let shdr = Shdr::parse_raw(
            reader.bytes(),
            header.sh_offset as usize + i * entsize,
            reader.sixty_four_bit,
            reader.little_endian,
        )?;
        let name = string_at(names, shdr.name as usize).unwrap_or("?");
        builder.push_record([
            name.to_string(),
            format!("{:x}", shdr.stype),
            format!("{:x}", shdr.addr),
            format!("{:x}", shdr.offset),
            format!("{:x}", shdr.size),
        ]);
    }

    let mut table = builder.build();
    for i in 1..headers.len() {
        table.modify(Columns::one(i), Alignment::right());
    }
    table.modify(Columns::first(), Padding::new(0, 1, 0, 0));
    table.with(Style::empty());
    println!("{table}");
    Ok(())
}
