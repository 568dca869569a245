//! Generic ELF file support: headers, segments, sections, notes and the
//! dynamic segment. These are used on three different images (the core, the
//! original executable, and the output under construction).
//! Quick ELF reference: https://gist.github.com/x0nu11byt3/bcb35c3de461e5fb66173071a2379779
//!
//! Program headers identify segments, which is all a core file has: for a core
//! the LOAD segments are the dumped memory regions and the single NOTE segment
//! carries process metadata. Section headers identify named ranges and are
//! normally absent from cores; synthesizing a meaningful table for one is the
//! whole point of this tool.
pub mod core_image;
pub mod dynamic;
pub mod header;
pub mod io;
pub mod notes;
pub mod sections;
pub mod segments;

pub use core_image::*;
pub use dynamic::*;
pub use header::*;
pub use io::*;
pub use notes::*;
pub use sections::*;
pub use segments::*;
