#[cfg(test)]
pub mod fixtures;

use nu_ansi_term::Color;
use std::error::Error;

pub fn require(predicate: bool, err: &str) -> Result<(), Box<dyn Error>> {
    if predicate { Ok(()) } else { Err(err.into()) }
}

/// Non-fatal diagnostics. Core files (and live processes) are often in worse
/// shape than the kernel documentation implies so we complain and keep going
/// wherever we can.
pub fn warn(mesg: &str) {
    eprintln!("{}", Color::Yellow.paint(mesg));
}

pub fn info(mesg: &str) {
    eprintln!("{}", Color::DarkGray.paint(mesg));
}

/// Note entries are always word aligned (4 bytes).
pub fn align4(n: u64) -> u64 {
    (n + 3) & !3
}

pub fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

pub fn align16(n: u64) -> u64 {
    (n + 15) & !15
}

/// Basename of a path-ish string. /proc map lines can name deleted files
/// (" (deleted)" suffix) so this works on raw strings, not Path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}
