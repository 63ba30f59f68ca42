use std::path::Path;

use crate::criu::image::{open_image, read_full};
use crate::criu::image_desc::ChannelKind;
use crate::criu::options::CrOptions;
use crate::criu::protobuf::pb_read_one;
use crate::criu::rst_malloc::{RstMem, RstMemType, RstPos};
use crate::criu::sockets::InetSkInfo;
use crate::error::{CrError, Result};
use crate::proto::TcpStreamEntry;

/// An established connection to be put back in repair mode.
pub struct TcpRepairSock {
    pub ino: u32,
    pub family: u32,
    pub src_addr: [u32; 4],
    pub src_port: u16,
    pub dst_addr: [u32; 4],
    pub dst_port: u16,
    pub stream: TcpStreamEntry,
    /// Receive queue followed by send queue, in private restore memory.
    pub queues: RstPos,
}

impl TcpRepairSock {
    pub fn inq<'a>(&self, mem: &'a RstMem) -> &'a [u8] {
        &mem.bytes(self.queues)[..self.stream.inq_len as usize]
    }

    pub fn outq<'a>(&self, mem: &'a RstMem) -> &'a [u8] {
        &mem.bytes(self.queues)[self.stream.inq_len as usize..]
    }
}

pub fn addr4(v: &[u32]) -> [u32; 4] {
    let mut a = [0u32; 4];
    for (dst, src) in a.iter_mut().zip(v.iter()) {
        *dst = *src;
    }
    a
}

fn read_tcp_stream(dir: &Path, sk: &InetSkInfo, mem: &mut RstMem) -> Result<TcpRepairSock> {
    let mut img = open_image(dir, ChannelKind::TcpStream, sk.ie.ino)?;
    let tse: TcpStreamEntry = pb_read_one(&mut img)?;

    let qlen = tse.inq_len as usize + tse.outq_len as usize;
    if qlen as u64 > img.raw_size()? {
        return Err(CrError::Socket(format!(
            "tcp stream {:#x}: queues of {} bytes past end of image",
            sk.ie.ino, qlen
        )));
    }

    let queues = mem.alloc(qlen, RstMemType::Private)?;
    let got = read_full(img.file_mut(), mem.bytes_mut(queues))?;
    if got < qlen {
        mem.free_last(RstMemType::Private);
        return Err(CrError::Socket(format!(
            "tcp stream {:#x}: read {} queue bytes while {} expected",
            sk.ie.ino, got, qlen
        )));
    }

    log::debug!(
        "Prepared tcp repair for {:#x}: inq {}/{:#x} outq {}/{:#x}",
        sk.ie.ino,
        tse.inq_len,
        tse.inq_seq,
        tse.outq_len,
        tse.outq_seq
    );

    Ok(TcpRepairSock {
        ino: sk.ie.ino,
        family: sk.ie.family,
        src_addr: addr4(&sk.ie.src_addr),
        src_port: sk.ie.src_port as u16,
        dst_addr: addr4(&sk.ie.dst_addr),
        dst_port: sk.ie.dst_port as u16,
        stream: tse,
        queues,
    })
}

/// Reads the repair state of every established TCP socket. Queue data is
/// kept in private restore memory. With `tcp_close` connections are not
/// restored and nothing is read.
pub fn prepare_tcp_sockets(
    dir: &Path,
    sockets: &[InetSkInfo],
    mem: &mut RstMem,
    opts: &CrOptions,
) -> Result<Vec<TcpRepairSock>> {
    if opts.tcp_close {
        log::info!("tcp-close is set, established connections won't be restored");
        return Ok(Vec::new());
    }

    let mut repair = Vec::new();
    for sk in sockets.iter().filter(|sk| sk.is_established_tcp()) {
        let rs = read_tcp_stream(dir, sk, mem).map_err(|e| match e {
            CrError::Socket(_) | CrError::RstMem(_) => e,
            other => CrError::Socket(format!("tcp stream {:#x}: {}", sk.ie.ino, other)),
        })?;
        repair.push(rs);
    }

    log::info!("{} tcp connections to repair", repair.len());
    Ok(repair)
}
