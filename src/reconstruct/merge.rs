//! Reinjects executable text into the core. The kernel writes a single page
//! for executable file mappings to keep cores small; this pass splices the
//! captured text image over that page and pushes every later LOAD segment's
//! file offset forward to make room.
use crate::elf::PT_LOAD;
use crate::elf::io::{get_half, get_word, get_xword};
use crate::elf::segments::PhdrSlot;
use crate::snapshot::MemDesc;
use crate::utils;
use memmap2::MmapOptions;
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// The page the kernel leaves in the file for a merged segment.
pub const PAGE_SIZE: u64 = 4096;

/// How the segment being merged is located among the LOAD headers.
#[derive(Clone, Copy)]
enum Locate {
    /// Main executable: the LOAD whose range contains the runtime text base.
    Containing,

    /// Shared library: the LOAD based exactly at the mapping address.
    Exact,
}

/// Merges the main executable's captured text into the core.
pub fn merge_exe_text(
    core_path: &Path,
    mem: &MemDesc,
    tmp_dir: &Path,
) -> Result<(), Box<dyn Error>> {
    utils::require(mem.text.base != 0, "could not find text address")?;
    utils::require(!mem.text_image.is_empty(), "no captured text to merge")?;
    merge_text_image(
        core_path,
        mem.text.base,
        &mem.text_image,
        tmp_dir,
        ".tmp_merged_core",
        Locate::Containing,
    )
}

/// Merges every captured shared-library text, one rewrite per library, each
/// against the core as the previous merge left it. Buffers are released as
/// soon as their library is done; with many large mappings the working set
/// matters.
pub fn merge_shlib_texts(
    core_path: &Path,
    mem: &mut MemDesc,
    tmp_dir: &Path,
) -> Result<(), Box<dyn Error>> {
    for map in &mut mem.maps {
        let image = match map.text_image.take() {
            Some(image) => image,
            None => continue,
        };
        let ret = merge_text_image(
            core_path,
            map.base,
            &image,
            tmp_dir,
            ".tmp_merging_shlibs",
            Locate::Exact,
        );
        drop(image);
        if let Err(err) = ret {
            utils::warn(&format!(
                "failed to merge library text at {:x}: {err}",
                map.base
            ));
        }
    }
    Ok(())
}

fn merge_text_image(
    core_path: &Path,
    text_vaddr: u64,
    image: &[u8],
    tmp_dir: &Path,
    tmp_stem: &str,
    locate: Locate,
) -> Result<(), Box<dyn Error>> {
    let file = File::open(core_path)?;
    // A private copy-on-write map: the phdr edits below land in our copy and
    // are streamed out to the temp file, never back into the core.
    let mut mem = unsafe { MmapOptions::new().map_copy(&file)? };
    let little_endian = mem[5] == 1;
    let sixty_four_bit = mem[4] == 2;
    let (ph_offset, ph_entsize, ph_num) = if sixty_four_bit {
        (
            get_xword(&mem, 32, little_endian)? as usize,
            get_half(&mem, 54, little_endian)? as usize,
            get_half(&mem, 56, little_endian)? as usize,
        )
    } else {
        (
            get_word(&mem, 28, little_endian)? as usize,
            get_half(&mem, 42, little_endian)? as usize,
            get_half(&mem, 44, little_endian)? as usize,
        )
    };

    let tlen = image.len() as u64;
    let shift = tlen - PAGE_SIZE;
    let mut text_offset = None;
    let mut next_offset = None;

    for i in 0..ph_num {
        let base = ph_offset + i * ph_entsize;
        let mut slot = PhdrSlot::new(&mut mem, base, sixty_four_bit, little_endian);
        if slot.ptype()? != PT_LOAD {
            continue;
        }
        let vaddr = slot.vaddr()?;
        if text_offset.is_none() {
            let hit = match locate {
                Locate::Exact => vaddr == text_vaddr,
                Locate::Containing => {
                    vaddr <= text_vaddr && text_vaddr < vaddr + slot.mem_size()?
                }
            };
            if hit {
                text_offset = Some(slot.offset()?);
                let mem_size = slot.mem_size()?;
                slot.set_file_size(mem_size)?;
            }
            continue;
        }
        // Every LOAD past the merged one moves forward to make room for the
        // whole text image.
        let offset = slot.offset()?;
        if next_offset.is_none() {
            next_offset = Some(offset);
        }
        slot.set_offset(offset + shift)?;
    }

    let text_offset = text_offset.ok_or("failed to merge text into core: segment not found")?;
    // A text segment with nothing after it means a malformed binary; any real
    // executable or library has a data segment following its text.
    let next_offset =
        next_offset.ok_or("text segment has no successor LOAD segment")? as usize;
    let text_offset = text_offset as usize;

    let tmp = temp_path(tmp_dir, tmp_stem);
    let mut out = File::create(&tmp)?;
    out.write_all(&mem[..text_offset])?;
    out.write_all(image)?;
    out.write_all(&mem[next_offset..])?;
    out.sync_all()?;
    drop(out);
    drop(mem);

    std::fs::rename(&tmp, core_path)?;
    std::fs::set_permissions(core_path, std::fs::Permissions::from_mode(0o777))?;
    Ok(())
}

/// Name collisions in the temp directory are resolved by a suffix counter.
fn temp_path(dir: &Path, stem: &str) -> PathBuf {
    let mut path = dir.join(stem);
    let mut i = 0;
    while path.exists() {
        i += 1;
        path = dir.join(format!("{stem}.{i}"));
    }
    path
}
