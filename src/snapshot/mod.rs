//! Introspection of the still-living target process via /proc. Everything
//! here happens before the core file is touched; the rest of the pipeline
//! works off the MemDesc this module produces.
pub mod fds;
pub mod maps;
pub mod process;

pub use fds::*;
pub use maps::*;
pub use process::*;
