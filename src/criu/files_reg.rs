//! Regular files and their remaps.
//!
//! Files that were unlinked while still open are dumped either as a hard
//! link made at dump time (linked remap), as a ghost file carrying the
//! contents, or as a reference to a dead process' proc entry. Whatever the
//! restore materializes for them has to be removed once it is no longer
//! needed; the records collected here describe that cleanup.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::criu::image::{open_image, open_image_optional};
use crate::criu::image_desc::ChannelKind;
use crate::criu::mount::MountNamespace;
use crate::criu::protobuf::{pb_read_one, pb_read_one_eof};
use crate::error::{CrError, Result, RetireFailure};
use crate::proto::{GhostFileEntry, RegFileEntry, RemapFilePathEntry, RemapType};

pub struct RegFileInfo {
    pub id: u32,
    pub rfe: RegFileEntry,
    /// Name with the leading slash stripped, `.` for the root itself.
    pub path: String,
}

impl RegFileInfo {
    pub fn new(rfe: RegFileEntry) -> Self {
        let path = if rfe.name == "/" {
            ".".to_string()
        } else {
            rfe.name.trim_start_matches('/').to_string()
        };

        Self { id: rfe.id, rfe, path }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapAction {
    Unlink,
    Rmdir,
    /// Nothing on disk to clean up.
    Keep,
}

#[derive(Debug, Clone)]
pub struct RemapRecord {
    pub orig_id: u32,
    pub remap_id: u32,
    pub remap_type: RemapType,
    /// Path of the remap file relative to the namespace root.
    pub rpath: String,
    pub is_dir: bool,
    pub mnt_id: Option<i32>,
}

impl RemapRecord {
    pub fn action(&self) -> RemapAction {
        match self.remap_type {
            RemapType::Procfs => RemapAction::Keep,
            RemapType::Linked | RemapType::Ghost if self.is_dir => RemapAction::Rmdir,
            RemapType::Linked | RemapType::Ghost => RemapAction::Unlink,
        }
    }
}

/// Outcome of retiring remaps. Failed records are listed, not raised.
#[derive(Debug, Default)]
pub struct RetireReport {
    pub retired: usize,
    pub kept: usize,
    pub failures: Vec<RetireFailure>,
}

impl RetireReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn collect_reg_files(dir: &Path) -> Result<HashMap<u32, RegFileInfo>> {
    let mut files = HashMap::new();

    let mut img = match open_image_optional(dir, ChannelKind::RegFiles, 0)? {
        Some(img) => img,
        None => return Ok(files),
    };

    log::info!("Collecting regular files");

    while let Some(rfe) = pb_read_one_eof::<RegFileEntry>(&mut img)? {
        let rfi = RegFileInfo::new(rfe);
        if Path::new(&rfi.path).components().any(|c| c == Component::ParentDir) {
            return Err(CrError::Collect(format!(
                "reg file {:#x} climbs out of its root: {}",
                rfi.id, rfi.rfe.name
            )));
        }
        log::info!("Collected reg file ID {:#x}", rfi.id);
        if files.insert(rfi.id, rfi).is_some() {
            return Err(CrError::Collect(format!("duplicate reg file id in {}", img.path().display())));
        }
    }

    log::debug!(" `- ... done");
    Ok(files)
}

fn ghost_is_dir(dir: &Path, remap_id: u32) -> Result<bool> {
    let mut img = open_image(dir, ChannelKind::GhostFile, remap_id)?;
    let gfe: GhostFileEntry = pb_read_one(&mut img)?;
    Ok(gfe.mode & libc::S_IFMT == libc::S_IFDIR)
}

fn collect_one_remap(
    dir: &Path,
    rpe: &RemapFilePathEntry,
    files: &HashMap<u32, RegFileInfo>,
) -> Result<RemapRecord> {
    let remap_type = match rpe.remap_type {
        None => RemapType::Linked,
        Some(raw) => RemapType::try_from(raw)
            .map_err(|_| CrError::Collect(format!("unknown remap type {}", raw)))?,
    };

    let orig = files.get(&rpe.orig_id).ok_or_else(|| {
        CrError::Collect(format!("no reg file {:#x} for remap {:#x}", rpe.orig_id, rpe.remap_id))
    })?;

    log::debug!(
        "Collecting remap orig_id={:#x} remap_id={:#x} type={:?}",
        rpe.orig_id,
        rpe.remap_id,
        remap_type
    );

    let record = match remap_type {
        RemapType::Linked => {
            let remap = files.get(&rpe.remap_id).ok_or_else(|| {
                CrError::Collect(format!("no link remap file {:#x} for {:#x}", rpe.remap_id, rpe.orig_id))
            })?;
            RemapRecord {
                orig_id: rpe.orig_id,
                remap_id: rpe.remap_id,
                remap_type,
                rpath: remap.path.clone(),
                is_dir: false,
                mnt_id: remap.rfe.mnt_id,
            }
        }
        RemapType::Ghost => {
            let is_dir = ghost_is_dir(dir, rpe.remap_id).map_err(|e| {
                CrError::Collect(format!("ghost file {:#x}: {}", rpe.remap_id, e))
            })?;
            RemapRecord {
                orig_id: rpe.orig_id,
                remap_id: rpe.remap_id,
                remap_type,
                rpath: format!("{}.cr.{:x}.ghost", orig.path, rpe.remap_id),
                is_dir,
                mnt_id: orig.rfe.mnt_id,
            }
        }
        RemapType::Procfs => RemapRecord {
            orig_id: rpe.orig_id,
            remap_id: rpe.remap_id,
            remap_type,
            rpath: orig.path.clone(),
            is_dir: false,
            mnt_id: orig.rfe.mnt_id,
        },
    };

    Ok(record)
}

fn collect_remaps(dir: &Path, files: &HashMap<u32, RegFileInfo>) -> Result<Vec<RemapRecord>> {
    let mut remaps = Vec::new();

    let mut img = match open_image_optional(dir, ChannelKind::RemapFpath, 0)? {
        Some(img) => img,
        None => return Ok(remaps),
    };

    log::info!("Collecting remaps");

    while let Some(rpe) = pb_read_one_eof::<RemapFilePathEntry>(&mut img)? {
        remaps.push(collect_one_remap(dir, &rpe, files)?);
    }

    log::debug!(" `- ... done");
    Ok(remaps)
}

/// Reads regular files and remap records. Absent images mean there is
/// nothing of that kind; broken or dangling entries fail the collection.
pub fn collect_remaps_and_regfiles(dir: &Path) -> Result<Vec<RemapRecord>> {
    let wrap = |e: CrError| match e {
        CrError::Collect(_) => e,
        other => CrError::Collect(other.to_string()),
    };

    let files = collect_reg_files(dir).map_err(wrap)?;
    let remaps = collect_remaps(dir, &files).map_err(wrap)?;

    log::info!("Collected {} reg files, {} remaps", files.len(), remaps.len());
    Ok(remaps)
}

fn clean_one_remap(rec: &RemapRecord, mntns: &MountNamespace) -> std::result::Result<PathBuf, RetireFailure> {
    let fail = |path: PathBuf, source: io::Error| RetireFailure {
        orig_id: rec.orig_id,
        path,
        source,
    };

    let path = mntns
        .remap_path(&rec.rpath, rec.mnt_id)
        .map_err(|msg| fail(PathBuf::from(&rec.rpath), io::Error::new(io::ErrorKind::NotFound, msg)))?;

    log::info!("Unlink remap {}", path.display());

    let ret = if rec.is_dir {
        std::fs::remove_dir(&path)
    } else {
        std::fs::remove_file(&path)
    };

    ret.map(|_| path.clone()).map_err(|e| fail(path, e))
}

/// Removes whatever the remaps left on disk. A record that can't be removed
/// is logged and reported; the remaining ones are still processed.
pub fn retire_remaps(records: Vec<RemapRecord>, mntns: &MountNamespace) -> RetireReport {
    let mut report = RetireReport::default();

    for rec in records {
        if rec.action() == RemapAction::Keep {
            report.kept += 1;
            continue;
        }

        match clean_one_remap(&rec, mntns) {
            Ok(_) => report.retired += 1,
            Err(failure) => {
                log::error!("Couldn't unlink remap {:#x}: {}", rec.orig_id, failure);
                report.failures.push(failure);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criu::image::{ImageSet, KindMask};
    use crate::criu::protobuf::pb_write_one;

    fn rfe(id: u32, name: &str) -> RegFileEntry {
        RegFileEntry {
            id,
            flags: 0,
            pos: 0,
            name: name.to_string(),
            mnt_id: None,
            size: None,
            mode: None,
        }
    }

    fn rpe(orig_id: u32, remap_id: u32, t: RemapType) -> RemapFilePathEntry {
        RemapFilePathEntry {
            orig_id,
            remap_id,
            remap_type: Some(t as i32),
        }
    }

    fn write_images(dir: &Path, files: &[RegFileEntry], remaps: &[RemapFilePathEntry]) {
        let mask = KindMask::of(&[ChannelKind::RegFiles, ChannelKind::RemapFpath]);
        let mut set = ImageSet::open_for_dump(dir, 0, mask).unwrap();
        for f in files {
            pb_write_one(set.get_mut(ChannelKind::RegFiles).unwrap(), f).unwrap();
        }
        for r in remaps {
            pb_write_one(set.get_mut(ChannelKind::RemapFpath).unwrap(), r).unwrap();
        }
    }

    fn write_ghost(dir: &Path, id: u32, mode: u32) {
        let mut set = ImageSet::open_for_dump(dir, id, KindMask::bit(ChannelKind::GhostFile)).unwrap();
        let gfe = GhostFileEntry { uid: 0, gid: 0, mode, dev: None, ino: None, size: None };
        pb_write_one(set.get_mut(ChannelKind::GhostFile).unwrap(), &gfe).unwrap();
    }

    #[test]
    fn test_reg_file_info_path() {
        assert_eq!(RegFileInfo::new(rfe(1, "/")).path, ".");
        assert_eq!(RegFileInfo::new(rfe(1, "/test/file")).path, "test/file");
    }

    #[test]
    fn test_no_images_no_remaps() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_remaps_and_regfiles(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_collect_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        write_images(
            dir.path(),
            &[rfe(1, "/tmp/orig"), rfe(2, "/tmp/link_remap.2"), rfe(3, "/tmp/gone"), rfe(4, "/proc/5/fd")],
            &[
                rpe(1, 2, RemapType::Linked),
                rpe(3, 0x10, RemapType::Ghost),
                rpe(4, 5, RemapType::Procfs),
            ],
        );
        write_ghost(dir.path(), 0x10, libc::S_IFREG | 0o644);

        let remaps = collect_remaps_and_regfiles(dir.path()).unwrap();
        assert_eq!(remaps.len(), 3);
        assert_eq!(remaps[0].rpath, "tmp/link_remap.2");
        assert_eq!(remaps[0].action(), RemapAction::Unlink);
        assert_eq!(remaps[1].rpath, "tmp/gone.cr.10.ghost");
        assert_eq!(remaps[2].action(), RemapAction::Keep);
    }

    #[test]
    fn test_ghost_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &[rfe(3, "/tmp/d")], &[rpe(3, 7, RemapType::Ghost)]);
        write_ghost(dir.path(), 7, libc::S_IFDIR | 0o755);

        let remaps = collect_remaps_and_regfiles(dir.path()).unwrap();
        assert_eq!(remaps[0].action(), RemapAction::Rmdir);
    }

    #[test]
    fn test_dangling_remap() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &[rfe(1, "/a")], &[rpe(9, 1, RemapType::Linked)]);
        assert!(matches!(collect_remaps_and_regfiles(dir.path()), Err(CrError::Collect(_))));
    }

    #[test]
    fn test_missing_ghost_image() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &[rfe(1, "/a")], &[rpe(1, 3, RemapType::Ghost)]);
        assert!(matches!(collect_remaps_and_regfiles(dir.path()), Err(CrError::Collect(_))));
    }

    #[test]
    fn test_unknown_remap_type() {
        let dir = tempfile::tempdir().unwrap();
        let bad = RemapFilePathEntry { orig_id: 1, remap_id: 1, remap_type: Some(42) };
        write_images(dir.path(), &[rfe(1, "/a")], &[bad]);
        assert!(matches!(collect_remaps_and_regfiles(dir.path()), Err(CrError::Collect(_))));
    }

    #[test]
    fn test_parent_dir_in_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_images(
            dir.path(),
            &[rfe(1, "/tmp/orig"), rfe(2, "/../../victim")],
            &[rpe(1, 2, RemapType::Linked)],
        );
        assert!(matches!(collect_remaps_and_regfiles(dir.path()), Err(CrError::Collect(_))));
    }

    #[test]
    fn test_retire_stays_under_root() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("rst");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("victim"), b"v").unwrap();

        let rec = RemapRecord {
            orig_id: 1,
            remap_id: 1,
            remap_type: RemapType::Ghost,
            rpath: "../victim".to_string(),
            is_dir: false,
            mnt_id: None,
        };
        let report = retire_remaps(vec![rec], &MountNamespace::host(&root));

        assert_eq!(report.retired, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(outer.path().join("victim").exists());
    }

    #[test]
    fn test_retire_continues_past_failure() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.ghost"), b"a").unwrap();
        std::fs::write(root.path().join("c.ghost"), b"c").unwrap();

        let rec = |id: u32, p: &str| RemapRecord {
            orig_id: id,
            remap_id: id,
            remap_type: RemapType::Ghost,
            rpath: p.to_string(),
            is_dir: false,
            mnt_id: None,
        };

        let records = vec![rec(1, "a.ghost"), rec(2, "missing.ghost"), rec(3, "c.ghost")];
        let report = retire_remaps(records, &MountNamespace::host(root.path()));

        assert_eq!(report.retired, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].orig_id, 2);
        assert!(!root.path().join("a.ghost").exists());
        assert!(!root.path().join("c.ghost").exists());
    }
}
