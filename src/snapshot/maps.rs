//! Typed parser for /proc/<pid>/maps. The format is one line per mapped
//! region:
//!
//!     address           perms offset  dev   inode       pathname
//!     00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
//!     00e03000-00e24000 rw-p 00000000 00:00 0           [heap]
//!     7fffb2d48000-7fffb2d49000 r-xp 00000000 00:00 0   [vdso]
//!
//! perms is rwx plus either p (private, copy on write) or s (shared). The
//! pseudo-paths [heap], [stack], [stack:<tid>], [vdso] and [vsyscall] name
//! kernel-provided regions; an empty pathname is an anonymous mapping.
use crate::elf::{PF_R, PF_W, PF_X};
use crate::utils;
use std::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Perms {
    pub fn parse(field: &str) -> Result<Self, Box<dyn Error>> {
        let bytes = field.as_bytes();
        utils::require(bytes.len() == 4, &format!("bad perms field: {field}"))?;
        Ok(Perms {
            read: bytes[0] == b'r',
            write: bytes[1] == b'w',
            exec: bytes[2] == b'x',
            shared: bytes[3] == b's',
        })
    }

    /// The ELF segment-flags view of the permission set.
    pub fn p_flags(&self) -> u32 {
        let mut flags = 0;
        if self.read {
            flags |= PF_R;
        }
        if self.write {
            flags |= PF_W;
        }
        if self.exec {
            flags |= PF_X;
        }
        flags
    }

    /// A ---p guard mapping.
    fn is_padding(&self) -> bool {
        !self.read && !self.write && !self.exec && !self.shared
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MappingKind {
    /// The main executable's text mapping.
    ExeText,

    /// Any other mapping of the main executable (data, relro).
    ExeData,

    SharedLib,
    Heap,
    Stack,
    ThreadStack(i32),
    Vdso,
    Vsyscall,

    /// A no-access guard region.
    Padding,

    AnonExe,
    FileExe,
    FileRegular,

    /// Shared (non-private) mapping, e.g. a shm segment.
    Special,

    /// Plain anonymous memory.
    Anon,
}

pub struct Mapping {
    pub base: u64,
    pub size: u64,
    pub flags: u32,
    pub kind: MappingKind,
    pub path: Option<String>,

    /// Text bytes captured from the live process for executable shared-lib
    /// mappings. Freed as soon as the merge pass is done with them.
    pub text_image: Option<Vec<u8>>,
}

impl Mapping {
    pub fn executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub fn is_shlib(&self) -> bool {
        self.kind == MappingKind::SharedLib
    }
}

struct MapLine {
    start: u64,
    end: u64,
    perms: Perms,
    path: Option<String>,
}

fn parse_line(line: &str) -> Result<MapLine, Box<dyn Error>> {
    let mut fields = line.split_whitespace();
    let range = fields.next().ok_or("empty maps line")?;
    let perms = Perms::parse(fields.next().ok_or("maps line missing perms")?)?;
    let _offset = fields.next().ok_or("maps line missing offset")?;
    let _dev = fields.next().ok_or("maps line missing dev")?;
    let _inode = fields.next().ok_or("maps line missing inode")?;
    // Paths can contain spaces (" (deleted)" notably), so keep the rest whole.
    let path = {
        let rest: Vec<&str> = fields.collect();
        if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        }
    };

    let (start, end) = range
        .split_once('-')
        .ok_or(format!("bad address range: {range}"))?;
    let start = u64::from_str_radix(start, 16)?;
    let end = u64::from_str_radix(end, 16)?;
    Ok(MapLine {
        start,
        end,
        perms,
        path,
    })
}

fn classify(line: &MapLine, exe_comm: &str) -> MappingKind {
    let path = line.path.as_deref().unwrap_or("");
    let base_name = utils::basename(path);

    if !path.is_empty() && base_name == exe_comm && !line.perms.is_padding() {
        return if line.perms.exec {
            MappingKind::ExeText
        } else {
            MappingKind::ExeData
        };
    }
    match path {
        "[heap]" => return MappingKind::Heap,
        "[stack]" => return MappingKind::Stack,
        "[vdso]" => return MappingKind::Vdso,
        "[vsyscall]" => return MappingKind::Vsyscall,
        _ => (),
    }
    if let Some(tid) = path.strip_prefix("[stack:").and_then(|s| s.strip_suffix(']')) {
        // The tid belongs to this line's record.
        return MappingKind::ThreadStack(tid.parse().unwrap_or(0));
    }
    if line.perms.is_padding() {
        return MappingKind::Padding;
    }
    if !path.is_empty() && base_name.contains(".so") {
        return MappingKind::SharedLib;
    }
    if !path.is_empty() {
        return if line.perms.exec {
            MappingKind::FileExe
        } else {
            MappingKind::FileRegular
        };
    }
    if line.perms.exec {
        return MappingKind::AnonExe;
    }
    if line.perms.shared {
        return MappingKind::Special;
    }
    MappingKind::Anon
}

/// Parses the whole maps text into classified records. exe_comm is the
/// basename of the executable, used to tell the main binary's own mappings
/// apart from everything else.
pub fn parse_maps(text: &str, exe_comm: &str) -> Result<Vec<Mapping>, Box<dyn Error>> {
    let mut maps = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = parse_line(line)?;
        let kind = classify(&parsed, exe_comm);
        maps.push(Mapping {
            base: parsed.start,
            size: parsed.end - parsed.start,
            flags: parsed.perms.p_flags(),
            kind,
            path: parsed.path,
            text_image: None,
        });
    }
    Ok(maps)
}
