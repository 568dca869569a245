//! The CORE notes in a core file: per-thread register state, process info,
//! signal info, the auxiliary vector and the kernel's file-mapping table.
//! See fill_files_note in
//! https://android.googlesource.com/kernel/common/+/6e7bfa046de8/fs/binfmt_elf.c
//!
//! The descriptors are kept as raw bytes because the section synthesizer
//! re-emits them verbatim as forensic payloads; only the handful of fields the
//! pipeline itself needs (pids, uids, the command name) are parsed out.
use super::{CoreImage, Stream};
use crate::utils;
use std::error::Error;

pub const NT_PRSTATUS: u32 = 1;
pub const NT_FPREGSET: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_SIGINFO: u32 = 0x53494749;
pub const NT_FILE: u32 = 0x46494c45;

// x86_64 sizes, see elf_prstatus and friends in
// https://docs.huihoo.com/doxygen/linux/kernel/3.7/uapi_2linux_2elfcore_8h_source.html
pub const PRSTATUS_SIZE: usize = 336;
pub const PRPSINFO_SIZE: usize = 136;
pub const SIGINFO_SIZE: usize = 128;
pub const FPREGSET_SIZE: usize = 512;
pub const ELF_PRARGSZ: usize = 80;

/// One NT_PRSTATUS record. The first one in the note region belongs to the
/// thread that crashed and stays first.
pub struct ThreadStatus {
    pub pid: i32,
    pub signo: i32,
    pub raw: Vec<u8>,
}

/// NT_PRPSINFO.
pub struct ProcessInfo {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    pub ppid: i32,
    pub fname: String,
    pub psargs: Vec<u8>,
    pub raw: Vec<u8>,
}

/// One row of the NT_FILE table. Kernel order is preserved: the data mapping
/// of a file directly follows its text mapping, and the lookups keyed on the
/// executable name depend on that.
#[derive(Clone)]
pub struct FileRange {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub path: String,
}

impl FileRange {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

pub struct NoteDesc {
    /// Primary thread first, then the rest in note order.
    pub threads: Vec<ThreadStatus>,
    pub psinfo: Option<ProcessInfo>,
    pub siginfo: Option<Vec<u8>>,
    pub auxv: Vec<u8>,
    pub fpregs: Option<Vec<u8>>,
    pub files: Vec<FileRange>,
}

impl NoteDesc {
    pub fn parse(core: &CoreImage) -> Result<Self, Box<dyn Error>> {
        let mut notes = NoteDesc {
            threads: Vec::new(),
            psinfo: None,
            siginfo: None,
            auxv: Vec::new(),
            fpregs: None,
            files: Vec::new(),
        };

        let end = (core.note_offset + core.note_size) as usize;
        let mut s = Stream::new(&core.reader, core.note_offset as usize);
        while s.offset + 12 <= end {
            let namesz = s.read_word()?;
            let descsz = s.read_word()? as usize;
            let ntype = s.read_word()?;

            let name = if namesz > 0 {
                let bytes = s.reader.slice(s.offset, namesz as usize - 1)?;
                String::from_utf8_lossy(bytes).into_owned()
            } else {
                String::new()
            };
            s.offset += utils::align4(namesz as u64) as usize;
            let desc_offset = s.offset;
            s.offset += utils::align4(descsz as u64) as usize;
            if desc_offset + descsz > end {
                utils::warn("note region is truncated, stopping the walk early");
                break;
            }

            if name != "CORE" {
                continue;
            }
            match ntype {
                NT_PRSTATUS => {
                    if descsz != PRSTATUS_SIZE {
                        utils::warn("NT_PRSTATUS note entry is not the correct size, skipping");
                        continue;
                    }
                    let raw = s.reader.slice(desc_offset, descsz)?.to_vec();
                    // pr_pid lives past pr_info/pr_cursig/pr_sigpend/pr_sighold.
                    let signo = s.reader.read_word(desc_offset)? as i32;
                    let pid = s.reader.read_word(desc_offset + 32)? as i32;
                    notes.threads.push(ThreadStatus { pid, signo, raw });
                }
                NT_PRPSINFO => {
                    if descsz != PRPSINFO_SIZE {
                        utils::warn("NT_PRPSINFO note entry is not the correct size, skipping");
                        continue;
                    }
                    let raw = s.reader.slice(desc_offset, descsz)?.to_vec();
                    notes.psinfo = Some(parse_psinfo(raw));
                }
                NT_SIGINFO => {
                    if descsz != SIGINFO_SIZE {
                        utils::warn("NT_SIGINFO note entry is not the correct size, skipping");
                        continue;
                    }
                    notes.siginfo = Some(s.reader.slice(desc_offset, descsz)?.to_vec());
                }
                NT_AUXV => {
                    notes.auxv = s.reader.slice(desc_offset, descsz)?.to_vec();
                }
                NT_FILE => {
                    let mut d = Stream::new(s.reader, desc_offset);
                    notes.files = parse_nt_file(&mut d)?;
                }
                NT_FPREGSET => {
                    if descsz != FPREGSET_SIZE {
                        utils::warn("NT_FPREGSET note entry is not the correct size, skipping");
                        continue;
                    }
                    notes.fpregs = Some(s.reader.slice(desc_offset, descsz)?.to_vec());
                }
                _ => (),
            }
        }
        Ok(notes)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn primary(&self) -> Option<&ThreadStatus> {
        self.threads.first()
    }
}

fn parse_psinfo(raw: Vec<u8>) -> ProcessInfo {
    fn word(raw: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(raw[at..at + 4].try_into().unwrap())
    }
    let fname_bytes = &raw[40..56];
    let fname_len = fname_bytes.iter().position(|b| *b == 0).unwrap_or(16);
    ProcessInfo {
        uid: word(&raw, 16),
        gid: word(&raw, 20),
        pid: word(&raw, 24) as i32,
        ppid: word(&raw, 28) as i32,
        fname: String::from_utf8_lossy(&fname_bytes[..fname_len]).into_owned(),
        psargs: raw[56..56 + ELF_PRARGSZ].to_vec(),
        raw,
    }
}

/// This function does the opposite of how the kernel packs files into the
/// NT_FILE note:
///
///   long count     -- how many files are mapped
///   long page_size -- units for file_ofs
///   array of [COUNT] elements of { long start; long end; long file_ofs; }
///   followed by COUNT filenames in ASCII: "FILE1" NUL "FILE2" NUL...
fn parse_nt_file(s: &mut Stream) -> Result<Vec<FileRange>, Box<dyn Error>> {
    let count = s.read_ulong()?;
    let _page_size = s.read_ulong()?;

    let mut ranges = Vec::new();
    for _ in 0..count {
        let start = s.read_ulong()?;
        let end = s.read_ulong()?;
        let file_offset = s.read_ulong()?;
        ranges.push(FileRange {
            start,
            end,
            file_offset,
            path: String::new(),
        });
    }
    for range in &mut ranges {
        range.path = s.read_string()?;
    }
    Ok(ranges)
}
