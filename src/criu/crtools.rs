//! Dump and show commands.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::criu::image::{read_full, Image, ImageSet, KindMask, CORE_KINDS, TASK_KINDS};
use crate::criu::image_desc::ChannelKind;
use crate::criu::inventory::write_img_inventory;
use crate::criu::options::{CrOptions, TaskFinalState};
use crate::criu::protobuf::{pb_read_one_eof, pb_write_one, read_raw_entry};
use crate::criu::pstree::read_pstree_image;
use crate::error::{CrError, Result};
use crate::proto::{
    GhostFileEntry, InetSkEntry, InventoryEntry, MntEntry, PstreeEntry, RegFileEntry, RemapFilePathEntry,
    TcpStreamEntry,
};

/// Parses `ppid`, `pgid` and `sid` out of `/proc/<pid>/stat`.
fn parse_stat_ids(stat: &str) -> Option<(u32, u32, u32)> {
    // comm may hold spaces and parens, the fields start after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(1);
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    let sid = fields.next()?.parse().ok()?;
    Some((ppid, pgid, sid))
}

fn read_task_ids(pid: u32) -> Result<PstreeEntry> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
    let (ppid, pgid, sid) = parse_stat_ids(&stat)
        .ok_or_else(|| CrError::Pstree(format!("can't parse /proc/{}/stat", pid)))?;

    let mut threads = Vec::new();
    for entry in fs::read_dir(format!("/proc/{}/task", pid))? {
        if let Some(tid) = entry?.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            threads.push(tid);
        }
    }
    threads.sort_unstable();

    Ok(PstreeEntry {
        pid,
        ppid,
        pgid,
        sid,
        threads,
    })
}

/// Children of every thread of `pid`. Kernels without the children file
/// report none.
fn read_children(pid: u32, threads: &[u32]) -> Vec<u32> {
    let mut children = Vec::new();
    for tid in threads {
        let path = format!("/proc/{}/task/{}/children", pid, tid);
        if let Ok(s) = fs::read_to_string(&path) {
            children.extend(s.split_whitespace().filter_map(|c| c.parse::<u32>().ok()));
        }
    }
    children
}

fn collect_tree(root: u32, leader_only: bool) -> Result<Vec<PstreeEntry>> {
    let mut tree = Vec::new();
    let mut queue = std::collections::VecDeque::from([root]);

    while let Some(pid) = queue.pop_front() {
        let entry = read_task_ids(pid)?;
        if !leader_only {
            queue.extend(read_children(pid, &entry.threads));
        }
        tree.push(entry);
    }

    Ok(tree)
}

/// Writes the inventory, the process tree and the per-task image sets of
/// the tree rooted at `pid`. Task memory and state are not dumped.
pub fn cr_dump_tasks(opts: &CrOptions, pid: u32) -> Result<()> {
    log::info!("Dumping processes (pid: {})", pid);

    let dir = opts.imgs_dir.as_path();
    let tree = collect_tree(pid, opts.leader_only)?;

    write_img_inventory(dir, opts, &format!("{:x}-{}", std::process::id(), pid))?;

    let mut root_set = ImageSet::open_for_dump(dir, pid, CORE_KINDS)?;
    root_set.extend_for_dump(dir, pid, TASK_KINDS)?;

    for entry in &tree {
        log::info!("Dumping task {} ({} threads)", entry.pid, entry.threads.len());
        if entry.pid != pid {
            let mut set = ImageSet::open_for_dump(dir, entry.pid, TASK_KINDS)?;
            set.close();
        }
        if let Some(img) = root_set.get_mut(ChannelKind::Pstree) {
            pb_write_one(img, entry)?;
        }
    }
    root_set.close();

    match opts.final_state {
        TaskFinalState::Run => log::info!("Leaving {} tasks running", tree.len()),
        TaskFinalState::Kill => {
            for entry in tree.iter().rev() {
                if unsafe { libc::kill(entry.pid as libc::pid_t, libc::SIGKILL) } < 0 {
                    log::warn!(
                        "Can't kill {}: {}",
                        entry.pid,
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
    }

    log::info!("Dumping finished successfully");
    Ok(())
}

fn show_entries<M: prost::Message + Default>(img: &mut Image, out: &mut dyn Write) -> Result<usize> {
    let mut n = 0;
    while let Some(e) = pb_read_one_eof::<M>(img)? {
        writeln!(out, "{:?}", e)?;
        n += 1;
    }
    Ok(n)
}

fn show_raw(img: &mut Image, hexdump: bool, out: &mut dyn Write) -> Result<usize> {
    if !hexdump {
        let mut n = 0;
        while let Some(buf) = read_raw_entry(img)? {
            writeln!(out, "entry of {} bytes", buf.len())?;
            n += 1;
        }
        return Ok(n);
    }

    let mut off = 0usize;
    let mut line = [0u8; 16];
    loop {
        let got = read_full(img.file_mut(), &mut line)?;
        if got == 0 {
            break;
        }
        let hex: Vec<String> = line[..got].iter().map(|b| format!("{:02x}", b)).collect();
        writeln!(out, "{:08x}: {}", off, hex.join(" "))?;
        off += got;
    }
    Ok(off)
}

fn show_entries_one<M: prost::Message + Default>(img: &mut Image, out: &mut dyn Write) -> Result<usize> {
    match pb_read_one_eof::<M>(img)? {
        Some(e) => {
            writeln!(out, "{:?}", e)?;
            Ok(1)
        }
        None => Ok(0),
    }
}

/// Prints one open image, positioned right after its magic.
fn show_image(opts: &CrOptions, img: &mut Image, out: &mut dyn Write) -> Result<()> {
    let kind = img.kind();

    writeln!(out, "{}: {}", img.path().display(), kind)?;
    writeln!(out, "----------------------------------------")?;

    let n = match kind {
        ChannelKind::Inventory => show_entries::<InventoryEntry>(img, out)?,
        ChannelKind::Pstree => show_entries::<PstreeEntry>(img, out)?,
        ChannelKind::RegFiles => show_entries::<RegFileEntry>(img, out)?,
        ChannelKind::RemapFpath => show_entries::<RemapFilePathEntry>(img, out)?,
        ChannelKind::GhostFile => show_entries::<GhostFileEntry>(img, out)?,
        ChannelKind::Mnts => show_entries::<MntEntry>(img, out)?,
        ChannelKind::Inetsk => show_entries::<InetSkEntry>(img, out)?,
        ChannelKind::TcpStream => {
            // queue data follows the one entry
            let n = show_entries_one::<TcpStreamEntry>(img, out)?;
            show_raw(img, true, out)?;
            n
        }
        ChannelKind::Pages | ChannelKind::PagesShmem => show_raw(img, opts.show_pages_content, out)?,
        _ => show_raw(img, false, out)?,
    };

    writeln!(out, "----------------------------------------")?;
    log::debug!("Shown {} entries of {}", n, img.path().display());
    Ok(())
}

/// Prints the contents of one image file.
pub fn cr_show_to(opts: &CrOptions, file: &Path, out: &mut dyn Write) -> Result<()> {
    let mut img = Image::open_by_path(file)?;
    show_image(opts, &mut img, out)
}

fn show_set(opts: &CrOptions, pid: u32, wanted: KindMask, out: &mut dyn Write) -> Result<()> {
    let dir = opts.imgs_dir.as_path();
    let mut set = ImageSet::open_for_restore(dir, pid, wanted)?;

    for kind in wanted.iter() {
        if let Some(img) = set.get_mut(kind) {
            show_image(opts, img, out)?;
        }
    }
    set.close();
    Ok(())
}

/// Prints every image dumped for the tree rooted at `pid`, or only for
/// `pid` itself in leader-only mode.
pub fn cr_show_task_to(opts: &CrOptions, pid: u32, out: &mut dyn Write) -> Result<()> {
    show_set(opts, pid, CORE_KINDS | TASK_KINDS, out)?;
    if opts.leader_only {
        return Ok(());
    }

    let tree = read_pstree_image(&opts.imgs_dir, pid)?;
    for item in tree.iter().filter(|i| i.pid != pid) {
        show_set(opts, item.pid, TASK_KINDS, out)?;
    }
    Ok(())
}

/// `show -f FILE` or `show -p|-t PID`.
pub fn cr_show(opts: &CrOptions, pid: Option<u32>) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match (opts.show_dump_file.as_deref(), pid) {
        (Some(file), _) => cr_show_to(opts, file, &mut out),
        (None, Some(pid)) => cr_show_task_to(opts, pid, &mut out),
        (None, None) => Err(CrError::Options("show needs an image file (-f) or a pid (-p/-t)".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_ids() {
        let stat = "1234 (my (odd) comm) S 1 1234 1234 0 -1 4194560";
        assert_eq!(parse_stat_ids(stat), Some((1, 1234, 1234)));
        assert_eq!(parse_stat_ids("garbage"), None);
    }

    #[test]
    fn test_read_self_ids() {
        let me = std::process::id();
        let e = read_task_ids(me).unwrap();
        assert_eq!(e.pid, me);
        assert!(e.threads.contains(&me));
        assert_eq!(e.ppid, unsafe { libc::getppid() } as u32);
    }

    #[test]
    fn test_show_pstree() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = ImageSet::open_for_dump(dir.path(), 7, KindMask::bit(ChannelKind::Pstree)).unwrap();
        let e = PstreeEntry { pid: 7, ppid: 1, pgid: 7, sid: 7, threads: vec![7] };
        pb_write_one(set.get_mut(ChannelKind::Pstree).unwrap(), &e).unwrap();
        set.close();

        let mut out = Vec::new();
        cr_show_to(&CrOptions::default(), &dir.path().join("pstree-7.img"), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(": pstree"));
        assert!(text.contains("pid: 7"));
    }

    #[test]
    fn test_show_pages_hexdump() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = ImageSet::open_for_dump(dir.path(), 3, KindMask::bit(ChannelKind::Pages)).unwrap();
        set.get_mut(ChannelKind::Pages).unwrap().file_mut().write_all(&[0xab; 20]).unwrap();
        set.close();

        let opts = CrOptions { show_pages_content: true, ..Default::default() };
        let mut out = Vec::new();
        cr_show_to(&opts, &dir.path().join("pages-3.img"), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("00000000: ab ab"));
        assert!(text.contains("00000010: ab ab ab ab\n"));
    }

    #[test]
    fn test_show_by_pid_after_dump() {
        let dir = tempfile::tempdir().unwrap();
        let me = std::process::id();
        let opts = CrOptions {
            final_state: TaskFinalState::Run,
            leader_only: true,
            imgs_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        cr_dump_tasks(&opts, me).unwrap();

        let mut out = Vec::new();
        cr_show_task_to(&opts, me, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("pstree-{}.img: pstree", me)));
        assert!(text.contains(&format!("pid: {}", me)));
        assert!(text.contains(&format!("pages-{}.img: pages", me)));
        assert!(text.contains(&format!("core-{}.img: core", me)));
    }

    #[test]
    fn test_show_by_pid_without_images() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CrOptions { imgs_dir: dir.path().to_path_buf(), ..Default::default() };
        assert!(cr_show_task_to(&opts, 1, &mut Vec::new()).is_err());
        assert!(matches!(cr_show(&opts, None), Err(CrError::Options(_))));
    }

    #[test]
    fn test_show_unknown_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.img");
        fs::write(&path, [0u8; 8]).unwrap();
        assert!(cr_show_to(&CrOptions::default(), &path, &mut Vec::new()).is_err());
    }
}
