//! Open file descriptors of the target, with socket inodes resolved against
//! the kernel's TCP and UDP tables. The records end up verbatim in the
//! output's .fdinfo section so the on-disk layout is fixed here.
use crate::utils;
use std::error::Error;
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Proto {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SocketInfo {
    pub proto: Proto,

    // Addresses exactly as the kernel prints them in /proc/net/tcp, i.e.
    // parsed from the hex fields as native integers. Ports are host order.
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

pub struct FdInfo {
    pub fd: i32,
    pub path: String,
    pub socket: Option<SocketInfo>,
}

/// On-disk .fdinfo record: fd (4), path (512, NUL padded), proto tag (4,
/// 0 = none / 1 = tcp / 2 = udp), src/dst addr (4 each), src/dst port
/// (2 each).
pub const FDINFO_RECORD_SIZE: usize = 532;
const FDINFO_PATH_MAX: usize = 512;

impl FdInfo {
    pub fn to_record(&self) -> [u8; FDINFO_RECORD_SIZE] {
        let mut rec = [0u8; FDINFO_RECORD_SIZE];
        rec[0..4].copy_from_slice(&self.fd.to_le_bytes());
        let path = self.path.as_bytes();
        let n = path.len().min(FDINFO_PATH_MAX - 1);
        rec[4..4 + n].copy_from_slice(&path[..n]);
        if let Some(sock) = &self.socket {
            let proto: u32 = match sock.proto {
                Proto::Tcp => 1,
                Proto::Udp => 2,
            };
            rec[516..520].copy_from_slice(&proto.to_le_bytes());
            rec[520..524].copy_from_slice(&sock.src_addr.to_le_bytes());
            rec[524..528].copy_from_slice(&sock.dst_addr.to_le_bytes());
            rec[528..530].copy_from_slice(&sock.src_port.to_le_bytes());
            rec[530..532].copy_from_slice(&sock.dst_port.to_le_bytes());
        }
        rec
    }
}

pub fn pack_fd_records(fds: &[FdInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fds.len() * FDINFO_RECORD_SIZE);
    for fd in fds {
        out.extend_from_slice(&fd.to_record());
    }
    out
}

/// Walks /proc/<pid>/fd and resolves each symlink; socket links get their
/// inode looked up in the TCP table and then the UDP table, first match wins.
pub fn read_fd_table(pid: i32) -> Result<Vec<FdInfo>, Box<dyn Error>> {
    let dir = format!("/proc/{pid}/fd");
    let mut fds = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let fd: i32 = match name.parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let target = match std::fs::read_link(entry.path()) {
            Ok(t) => t.to_string_lossy().into_owned(),
            Err(err) => {
                utils::warn(&format!("readlink {dir}/{name}: {err}"));
                continue;
            }
        };
        let socket = target
            .strip_prefix("socket:[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|inode| inode.parse::<u64>().ok())
            .and_then(resolve_socket);
        fds.push(FdInfo {
            fd,
            path: target,
            socket,
        });
    }
    fds.sort_by_key(|f| f.fd);
    Ok(fds)
}

fn resolve_socket(inode: u64) -> Option<SocketInfo> {
    for (path, proto) in [
        ("/proc/net/tcp", Proto::Tcp),
        ("/proc/net/udp", Proto::Udp),
    ] {
        if let Ok(text) = std::fs::read_to_string(Path::new(path))
            && let Some(sock) = scan_net_table(&text, inode, proto)
        {
            return Some(sock);
        }
    }
    None
}

/// One /proc/net/{tcp,udp} line looks like
///
///   0: 0100007F:1F90 0A000001:01BB 01 00000000:00000000 00:00000000 00000000  1000 0 8123 ...
///
/// with addresses as hex in kernel byte order and the inode in the tenth
/// field.
fn scan_net_table(text: &str, inode: u64, proto: Proto) -> Option<SocketInfo> {
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let row_inode: u64 = match fields[9].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if row_inode != inode {
            continue;
        }
        let (src_addr, src_port) = parse_addr_port(fields[1])?;
        let (dst_addr, dst_port) = parse_addr_port(fields[2])?;
        return Some(SocketInfo {
            proto,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
        });
    }
    None
}

fn parse_addr_port(field: &str) -> Option<(u32, u16)> {
    let (addr, port) = field.split_once(':')?;
    let addr = u32::from_str_radix(addr, 16).ok()?;
    let port = u16::from_str_radix(port, 16).ok()?;
    Some((addr, port))
}
