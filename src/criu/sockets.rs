use std::path::Path;

use crate::criu::image::open_image_optional;
use crate::criu::image_desc::ChannelKind;
use crate::criu::protobuf::pb_read_one_eof;
use crate::criu::rst_malloc::{RstMem, RstMemType, RstPos};
use crate::error::{CrError, Result};
use crate::proto::InetSkEntry;

pub const TCP_ESTABLISHED: u32 = 1;

/// A dumped inet socket. `fd_slot` is the shared word the restoring task
/// publishes the socket's descriptor in.
pub struct InetSkInfo {
    pub ie: InetSkEntry,
    pub fd_slot: RstPos,
}

impl InetSkInfo {
    pub fn is_tcp(&self) -> bool {
        self.ie.proto == libc::IPPROTO_TCP as u32
    }

    pub fn is_established_tcp(&self) -> bool {
        self.is_tcp() && self.ie.state == TCP_ESTABLISHED
    }

    pub fn sk_fd(&self, mem: &RstMem) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(mem.bytes(self.fd_slot));
        i32::from_ne_bytes(raw)
    }
}

fn check_inet_entry(ie: &InetSkEntry) -> Result<()> {
    let addr_len = match ie.family as i32 {
        libc::AF_INET => 1,
        libc::AF_INET6 => 4,
        other => {
            return Err(CrError::Socket(format!(
                "inet socket {:#x} has unknown family {}",
                ie.id, other
            )))
        }
    };

    if ie.src_addr.len() < addr_len || (ie.state == TCP_ESTABLISHED && ie.dst_addr.len() < addr_len) {
        return Err(CrError::Socket(format!("inet socket {:#x} has short addresses", ie.id)));
    }

    if ie.src_port > u16::MAX as u32 || ie.dst_port > u16::MAX as u32 {
        return Err(CrError::Socket(format!("inet socket {:#x} has a bad port", ie.id)));
    }

    Ok(())
}

/// Collects the inet sockets of `entity`. Every socket gets its descriptor
/// slot in shared restore memory, so this must run before the memory is
/// switched to private mode.
pub fn collect_inet_sockets(dir: &Path, entity: u32, mem: &mut RstMem) -> Result<Vec<InetSkInfo>> {
    let mut sockets = Vec::new();

    let mut img = match open_image_optional(dir, ChannelKind::Inetsk, entity)? {
        Some(img) => img,
        None => return Ok(sockets),
    };

    while let Some(ie) = pb_read_one_eof::<InetSkEntry>(&mut img)? {
        check_inet_entry(&ie)?;

        let fd_slot = mem.alloc(std::mem::size_of::<i32>(), RstMemType::Shared)?;
        mem.bytes_mut(fd_slot).copy_from_slice(&(-1i32).to_ne_bytes());

        log::debug!(
            "Collected inet sk {:#x} ino {:#x} proto {} state {}",
            ie.id,
            ie.ino,
            ie.proto,
            ie.state
        );
        sockets.push(InetSkInfo { ie, fd_slot });
    }

    log::info!("Collected {} inet sockets", sockets.len());
    Ok(sockets)
}
