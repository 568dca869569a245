//! The live-process side of the pipeline: everything we can only learn while
//! the target still exists in /proc. All live-memory reads happen inside the
//! stopped window that StopGuard manages.
use super::fds::{self, FdInfo};
use super::maps::{self, Mapping, MappingKind};
use crate::elf::notes::NoteDesc;
use crate::utils;
use rangemap::RangeMap;
use std::error::Error;
use std::fs::File;
use std::os::unix::fs::FileExt;

/// Delivers SIGSTOP on creation and SIGCONT when dropped, so the target is
/// never left frozen, error paths included.
pub struct StopGuard {
    pid: i32,
}

impl StopGuard {
    pub fn stop(pid: i32) -> Result<Self, Box<dyn Error>> {
        let ret = unsafe { libc::kill(pid, libc::SIGSTOP) };
        utils::require(ret == 0, &format!("failed to deliver SIGSTOP to {pid}"))?;
        Ok(StopGuard { pid })
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        let ret = unsafe { libc::kill(self.pid, libc::SIGCONT) };
        if ret != 0 {
            utils::warn(&format!("failed to deliver SIGCONT to {}", self.pid));
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct Region {
    pub base: u64,
    pub size: u64,
}

#[derive(Default)]
pub struct Task {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    pub ppid: i32,
    pub exit_signal: i32,
}

/// The live process view: mapping list, fd table, executable identity, the
/// well-known regions, and the captured text of the main executable.
pub struct MemDesc {
    pub task: Task,
    pub comm: String,
    pub exe_path: String,
    pub maps: Vec<Mapping>,
    pub fds: Vec<FdInfo>,

    pub text: Region,
    pub data: Region,
    pub heap: Region,
    pub stack: Region,
    pub vdso: Region,
    pub vsyscall: Region,

    /// Main executable text, read from /proc/<pid>/mem.
    pub text_image: Vec<u8>,

    index: RangeMap<u64, usize>,
}

impl MemDesc {
    /// Reads the /proc view of pid. Live memory is not touched here; call
    /// capture_text_images() inside the stopped window for that.
    pub fn snapshot(pid: i32) -> Result<Self, Box<dyn Error>> {
        let exe_path = resolve_exe_path(pid)?;
        let comm = utils::basename(&exe_path).to_string();

        let maps_text = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
        let maps = maps::parse_maps(&maps_text, &comm)?;

        let mut desc = MemDesc {
            task: Task {
                pid,
                ..Task::default()
            },
            comm,
            exe_path,
            fds: fds::read_fd_table(pid)?,
            text: Region::default(),
            data: Region::default(),
            heap: Region::default(),
            stack: Region::default(),
            vdso: Region::default(),
            vsyscall: Region::default(),
            text_image: Vec::new(),
            index: RangeMap::new(),
            maps,
        };

        for (i, map) in desc.maps.iter().enumerate() {
            let region = Region {
                base: map.base,
                size: map.size,
            };
            match map.kind {
                MappingKind::ExeText => desc.text = region,
                // The first data mapping of the exe is the one the phdr
                // cross-reference wants.
                MappingKind::ExeData if desc.data.size == 0 => desc.data = region,
                MappingKind::Heap => desc.heap = region,
                MappingKind::Stack => desc.stack = region,
                MappingKind::Vdso => desc.vdso = region,
                MappingKind::Vsyscall => desc.vsyscall = region,
                _ => (),
            }
            if map.size > 0 {
                desc.index.insert(map.base..map.base + map.size, i);
            }
        }
        utils::require(desc.text.size > 0, "could not find executable text mapping")?;
        Ok(desc)
    }

    pub fn mapping_containing(&self, vaddr: u64) -> Option<&Mapping> {
        self.index.get(&vaddr).map(|i| &self.maps[*i])
    }

    /// Fills the task fields only the core notes know.
    pub fn fill_from_notes(&mut self, notes: &NoteDesc) {
        if let Some(psinfo) = &notes.psinfo {
            self.task.uid = psinfo.uid;
            self.task.gid = psinfo.gid;
            self.task.ppid = psinfo.ppid;
        }
        if let Some(primary) = notes.primary() {
            self.task.exit_signal = primary.signo;
        }
    }

    /// Reads the main executable's text and the text of every executable
    /// shared-library mapping out of the live image. A failed library read is
    /// logged and that library is skipped; a failed main-text read is fatal
    /// because there is nothing to merge without it.
    pub fn capture_text_images(&mut self) -> Result<(), Box<dyn Error>> {
        let mem = File::open(format!("/proc/{}/mem", self.task.pid))?;

        utils::require(
            self.mapping_containing(self.text.base).is_some(),
            "executable text is not a valid process mapping",
        )?;
        self.text_image = read_pmem(&mem, self.text.base, self.text.size as usize)?;

        for map in &mut self.maps {
            if !map.is_shlib() || !map.executable() {
                continue;
            }
            match read_pmem(&mem, map.base, map.size as usize) {
                Ok(image) => map.text_image = Some(image),
                Err(err) => {
                    utils::warn(&format!(
                        "failed to read shared library text at {:x}: {err}",
                        map.base
                    ));
                }
            }
        }
        Ok(())
    }
}

impl MemDesc {
    /// A blank MemDesc for tests that only poke at a few fields; snapshot()
    /// needs a live target.
    #[cfg(test)]
    pub fn empty_for_tests() -> Self {
        MemDesc {
            task: Task::default(),
            comm: String::new(),
            exe_path: String::new(),
            maps: Vec::new(),
            fds: Vec::new(),
            text: Region::default(),
            data: Region::default(),
            heap: Region::default(),
            stack: Region::default(),
            vdso: Region::default(),
            vsyscall: Region::default(),
            text_image: Vec::new(),
            index: RangeMap::new(),
        }
    }
}

fn read_pmem(mem: &File, vaddr: u64, len: usize) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut buf = vec![0u8; len];
    let bytes = mem.read_at(&mut buf, vaddr)?;
    utils::require(
        bytes == len,
        &format!("short pmem read at {vaddr:x} [read {bytes} bytes]"),
    )?;
    Ok(buf)
}

/// /proc/<pid>/exe, dereferenced once more in case the target's binary is
/// itself a symlink.
fn resolve_exe_path(pid: i32) -> Result<String, Box<dyn Error>> {
    let first = std::fs::read_link(format!("/proc/{pid}/exe"))?;
    let path = match std::fs::read_link(&first) {
        Ok(second) => second,
        Err(_) => first,
    };
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    // /proc/self gives us a real process to snapshot without having to spawn
    // and stop anything.
    #[test]
    fn snapshot_of_self() {
        let pid = std::process::id() as i32;
        let desc = MemDesc::snapshot(pid).unwrap();
        assert!(desc.text.size > 0);
        assert!(!desc.maps.is_empty());
        assert!(!desc.comm.is_empty());
        assert!(desc.exe_path.starts_with('/'));
        assert!(desc.mapping_containing(desc.text.base).is_some());
        assert!(desc.mapping_containing(1).is_none());
    }

    #[test]
    fn pmem_reads_our_own_memory() {
        let marker = *b"ecfs pmem marker";
        let mem = File::open("/proc/self/mem").unwrap();
        let got = read_pmem(&mem, marker.as_ptr() as u64, marker.len()).unwrap();
        assert_eq!(got, marker);
    }
}
