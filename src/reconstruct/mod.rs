//! The ECFS-specific rebuild stages: text merging, address cross-referencing,
//! section synthesis and symbol reconstruction.
pub mod merge;
pub mod report;
pub mod symtab;
pub mod synth;
pub mod xref;

pub use merge::*;
pub use report::*;
pub use symtab::*;
pub use synth::*;
pub use xref::*;

use crate::elf::{CoreImage, DynMeta, notes::NoteDesc};
use crate::snapshot::MemDesc;

/// Root of the data model. The pipeline assembles this once the merge passes
/// are done and every later stage reads from it; subordinate records refer to
/// each other by index, never by back-pointer.
pub struct Handle {
    pub core: CoreImage,
    pub mem: MemDesc,
    pub notes: NoteDesc,
    pub layout: Layout,
    pub dynmeta: DynMeta,
    pub fallbacks: Fallbacks,
    pub personality: Personality,
    pub libs: Vec<LibMapping>,

    /// Fixed-width command line buffer (ELF_PRARGSZ bytes).
    pub arglist: Vec<u8>,
}
