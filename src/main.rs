//! ecfs: transforms a kernel core dump plus live introspection of the dumped
//! process into an ECFS file, a superset of the core with full executable
//! text, forensic payloads and a synthesized section-header table.
mod elf;
mod reconstruct;
mod snapshot;
mod utils;

use clap::Parser;
use elf::{CoreImage, DynContext, DynMeta, Reader, notes::NoteDesc};
use memmap2::Mmap;
use reconstruct::{FuncDesc, Handle};
use snapshot::{MemDesc, StopGuard};
use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use utils::warn;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// path to the core file the kernel produced
    core: PathBuf,

    /// pid of the dumped (still living) process
    pid: i32,

    /// where to write the ECFS file
    #[arg(short, long)]
    output: PathBuf,

    /// keep text-merge temp files on a ramdisk
    #[arg(long)]
    ramdisk: bool,

    /// set the heuristics personality bit and tag libraries the detector
    /// flags as injected
    #[arg(long)]
    heuristics: bool,

    /// print the synthesized section table when done
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        warn(&format!("ecfs failed: {e}"));
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    // Snapshot the live side first. The guard keeps the target stopped for
    // every live-memory read below and continues it again on all paths out of
    // this function, including errors.
    let stopped = StopGuard::stop(cli.pid)?;
    let mut mem = MemDesc::snapshot(cli.pid)?;

    let core = CoreImage::load(cli.core.clone())?;
    let notes = NoteDesc::parse(&core)?;
    mem.fill_from_notes(&notes);

    utils::info(&format!(
        "snapshot of pid {}: {} mappings, {} threads",
        cli.pid,
        mem.maps.len(),
        notes.thread_count()
    ));

    mem.capture_text_images()?;
    drop(stopped);

    // The merges rewrite the backing file, so the mapping is torn down first
    // and a fresh CoreImage is loaded once the file is final.
    drop(core);
    let tmp_dir = temp_dir(cli);
    utils::info("merging executable text into core");
    reconstruct::merge_exe_text(&cli.core, &mem, &tmp_dir)?;
    reconstruct::merge_shlib_texts(&cli.core, &mut mem, &tmp_dir)?;
    let core = CoreImage::load(cli.core.clone())?;

    // Cross-reference the three views of the address space.
    let exe_file = File::open(&mem.exe_path)?;
    let exe_reader = Reader::new(unsafe { Mmap::map(&exe_file)? })?;
    let mut layout = reconstruct::parse_orig_phdrs(&exe_reader, &mem, &notes.files)?;
    let fallbacks = reconstruct::Fallbacks::pull(&exe_reader)?;
    if layout.pie {
        // The phdr after PT_NOTE is not the text segment for PIE cores.
        if let Some((_filesz, memsz)) =
            reconstruct::text_phdr_size_with_hint(&core.phdrs, mem.text.base)
        {
            layout.text_size = memsz;
        }
    }
    reconstruct::xref_offsets(&core.phdrs, &mut layout, &fallbacks);
    let libs = reconstruct::lookup_lib_maps(&core.phdrs, &mem, &notes.files);
    let personality = reconstruct::build_personality(&exe_reader, &layout, cli.heuristics)?;

    let dynmeta = if layout.dynlinked {
        DynMeta::parse(
            &core,
            &DynContext {
                text_vaddr: layout.text_vaddr,
                text_offset: layout.text_offset,
                data_vaddr: layout.data_vaddr,
                data_offset: layout.data_offset,
                dyn_vaddr: layout.dyn_vaddr,
                pie: layout.pie,
            },
        )?
    } else {
        DynMeta::default()
    };

    let arglist = notes
        .psinfo
        .as_ref()
        .map(|p| p.psargs.clone())
        .unwrap_or_default();

    let mut handle = Handle {
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

    utils::info(&format!("writing {}", cli.output.display()));
    let ecfs = reconstruct::core2ecfs(&cli.output, &mut handle)?;

    // The function table comes from the exception-frame unwinder, which runs
    // as a separate collaborator; with nothing wired up the symbol tables
    // come out empty but well formed.
    // TODO feed the unwinder's {addr, size} records in here so stripped
    // binaries get their sub_<addr> symbols back
    let funcs: Vec<FuncDesc> = Vec::new();
    reconstruct::build_local_symtab_and_finalize(&cli.output, &ecfs, &funcs)?;

    if cli.verbose {
        reconstruct::print_section_summary(&cli.output)?;
    }
    Ok(())
}

fn temp_dir(cli: &Cli) -> PathBuf {
    if cli.ramdisk {
        PathBuf::from("/dev/shm")
    } else {
        cli.core
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
