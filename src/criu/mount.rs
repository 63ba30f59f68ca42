//! Mount namespace preparation.
//!
//! The mount tree of the root task is read from its `mountpoints` image and
//! anchored at the restore root. Later stages use it to map paths seen by
//! the dumped tasks onto the restorer's filesystem view.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::criu::image::open_image_optional;
use crate::criu::image_desc::ChannelKind;
use crate::criu::protobuf::pb_read_all;
use crate::criu::util::{get_relative_path, path_under_root};
use crate::error::{CrError, Result};
use crate::proto::MntEntry;

pub struct MountInfo {
    pub mnt_id: i32,
    pub parent_mnt_id: i32,
    pub root: String,
    /// Mountpoint as seen inside the namespace.
    pub ns_mountpoint: String,
    pub source: String,
    pub fstype: u32,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl MountInfo {
    pub fn new(mnt_id: i32) -> Self {
        Self {
            mnt_id,
            parent_mnt_id: 0,
            root: String::from("/"),
            ns_mountpoint: String::from("/"),
            source: String::new(),
            fstype: 0,
            parent: None,
            children: Vec::new(),
        }
    }

    fn from_entry(me: &MntEntry) -> Self {
        Self {
            mnt_id: me.mnt_id as i32,
            parent_mnt_id: me.parent_mnt_id as i32,
            root: me.root.clone(),
            ns_mountpoint: me.mountpoint.clone(),
            source: me.source.clone(),
            fstype: me.fstype,
            parent: None,
            children: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct MountInfoStore {
    mounts: Vec<MountInfo>,
    by_id: HashMap<i32, usize>,
}

impl MountInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mi: MountInfo) -> Result<usize> {
        let idx = self.mounts.len();
        if self.by_id.insert(mi.mnt_id, idx).is_some() {
            return Err(CrError::Mount(format!("duplicate mount id {}", mi.mnt_id)));
        }
        self.mounts.push(mi);
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&MountInfo> {
        self.mounts.get(idx)
    }

    pub fn lookup_mnt_id(&self, id: i32) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountInfo> {
        self.mounts.iter()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Links every mount to its parent and returns the index of the root.
    /// Exactly one mount may lack a parent in the store and it must sit
    /// at `/`.
    pub fn mnt_build_tree(&mut self) -> Result<usize> {
        let mut root: Option<usize> = None;

        for idx in 0..self.mounts.len() {
            let parent_id = self.mounts[idx].parent_mnt_id;
            let parent = self.lookup_mnt_id(parent_id).filter(|&p| p != idx);

            match parent {
                Some(p) => {
                    self.mounts[idx].parent = Some(p);
                    self.mounts[p].children.push(idx);
                }
                None => {
                    if let Some(prev) = root {
                        return Err(CrError::Mount(format!(
                            "mounts {} and {} both lack a parent",
                            self.mounts[prev].mnt_id, self.mounts[idx].mnt_id
                        )));
                    }
                    root = Some(idx);
                }
            }
        }

        let root = root.ok_or_else(|| CrError::Mount("no root mount found".into()))?;
        if get_relative_path(&self.mounts[root].ns_mountpoint, "/") != Some(PathBuf::new()) {
            return Err(CrError::Mount(format!(
                "root mount {} sits at {}",
                self.mounts[root].mnt_id, self.mounts[root].ns_mountpoint
            )));
        }

        // every mount has to be reachable from the root, loops are not
        let mut seen = vec![false; self.mounts.len()];
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            stack.extend(self.mounts[idx].children.iter().copied());
        }
        if let Some(idx) = seen.iter().position(|s| !s) {
            return Err(CrError::Mount(format!(
                "mount {} is not reachable from the root",
                self.mounts[idx].mnt_id
            )));
        }

        Ok(root)
    }

    pub fn mnt_tree_show(&self, idx: usize, depth: usize) {
        let mi = &self.mounts[idx];
        log::debug!("{:width$}[{}]({}) {}", "", mi.mnt_id, mi.source, mi.ns_mountpoint, width = depth * 2);
        for &child in &mi.children {
            self.mnt_tree_show(child, depth + 1);
        }
    }
}

/// The filesystem view restored tasks will see.
pub struct MountNamespace {
    root: PathBuf,
    tree: Option<(MountInfoStore, usize)>,
}

impl MountNamespace {
    /// No mount namespace in the images; paths are taken as-is under `root`.
    pub fn host(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tree: None,
        }
    }

    pub fn from_store(root: impl Into<PathBuf>, mut store: MountInfoStore) -> Result<Self> {
        let root_idx = store.mnt_build_tree()?;
        store.mnt_tree_show(root_idx, 0);
        Ok(Self {
            root: root.into(),
            tree: Some((store, root_idx)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_tree(&self) -> bool {
        self.tree.is_some()
    }

    pub fn mounts(&self) -> Option<&MountInfoStore> {
        self.tree.as_ref().map(|(store, _)| store)
    }

    /// Maps a path recorded on mount `mnt_id` onto the restorer's view.
    pub fn remap_path(&self, rpath: &str, mnt_id: Option<i32>) -> std::result::Result<PathBuf, String> {
        let (store, root_idx) = match &self.tree {
            None => return Ok(path_under_root(&self.root, rpath)),
            Some((store, root_idx)) => (store, *root_idx),
        };

        let mi_idx = match mnt_id {
            Some(id) => store
                .lookup_mnt_id(id)
                .ok_or_else(|| format!("The {} mount is not found for {}", id, rpath))?,
            None => root_idx,
        };
        let mi = &store.mounts[mi_idx];

        let rel = get_relative_path(rpath, &mi.ns_mountpoint)
            .ok_or_else(|| format!("Can't get path {} relative to {}", rpath, mi.ns_mountpoint))?;

        let path = path_under_root(&self.root, &mi.ns_mountpoint).join(rel);
        if path.as_os_str().len() >= libc::PATH_MAX as usize {
            return Err(format!("Path too long: {}", path.display()));
        }
        Ok(path)
    }
}

/// Reads the mount tree of namespace `ns_id`. Without a mountpoints image
/// the host view anchored at `root` is used.
pub fn prepare_mnt_ns(dir: &Path, ns_id: u32, root: &Path) -> Result<MountNamespace> {
    let mut img = match open_image_optional(dir, ChannelKind::Mnts, ns_id)? {
        Some(img) => img,
        None => {
            log::info!("No mount namespace image, using host view at {}", root.display());
            return Ok(MountNamespace::host(root));
        }
    };

    log::info!("Reading mountpoints for namespace {}", ns_id);

    let entries: Vec<MntEntry> = pb_read_all(&mut img)?;
    let mut store = MountInfoStore::new();
    for me in &entries {
        log::debug!("\tRead {} mp @ {}", me.mnt_id, me.mountpoint);
        store.add(MountInfo::from_entry(me))?;
    }

    if store.is_empty() {
        return Err(CrError::Mount(format!("empty mountpoints image for {}", ns_id)));
    }

    MountNamespace::from_store(root, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mnt(id: i32, parent: i32, mp: &str) -> MountInfo {
        let mut mi = MountInfo::new(id);
        mi.parent_mnt_id = parent;
        mi.ns_mountpoint = mp.to_string();
        mi
    }

    fn sample_store() -> MountInfoStore {
        let mut store = MountInfoStore::new();
        store.add(mnt(1, 0, "/")).unwrap();
        store.add(mnt(2, 1, "/tmp")).unwrap();
        store.add(mnt(3, 2, "/tmp/inner")).unwrap();
        store
    }

    #[test]
    fn test_build_tree() {
        let mut store = sample_store();
        let root = store.mnt_build_tree().unwrap();
        assert_eq!(store.get(root).unwrap().mnt_id, 1);
        assert_eq!(store.get(1).unwrap().parent, Some(0));
        assert_eq!(store.get(0).unwrap().children, vec![1]);
    }

    #[test]
    fn test_build_tree_two_roots() {
        let mut store = sample_store();
        store.add(mnt(9, 42, "/")).unwrap();
        assert!(store.mnt_build_tree().is_err());
    }

    #[test]
    fn test_build_tree_root_not_at_slash() {
        let mut store = MountInfoStore::new();
        store.add(mnt(1, 0, "/mnt")).unwrap();
        assert!(store.mnt_build_tree().is_err());
    }

    #[test]
    fn test_build_tree_cycle() {
        let mut store = MountInfoStore::new();
        store.add(mnt(1, 0, "/")).unwrap();
        store.add(mnt(2, 3, "/a")).unwrap();
        store.add(mnt(3, 2, "/b")).unwrap();
        assert!(store.mnt_build_tree().is_err());
    }

    #[test]
    fn test_duplicate_mount_id() {
        let mut store = MountInfoStore::new();
        store.add(mnt(1, 0, "/")).unwrap();
        assert!(store.add(mnt(1, 0, "/x")).is_err());
    }

    #[test]
    fn test_remap_path_host() {
        let ns = MountNamespace::host("/srv/rst");
        assert_eq!(ns.remap_path("tmp/a.ghost", None).unwrap(), PathBuf::from("/srv/rst/tmp/a.ghost"));
    }

    #[test]
    fn test_remap_path_through_mount() {
        let ns = MountNamespace::from_store("/srv/rst", sample_store()).unwrap();
        assert_eq!(
            ns.remap_path("tmp/inner/f", Some(3)).unwrap(),
            PathBuf::from("/srv/rst/tmp/inner/f")
        );
        assert!(ns.remap_path("etc/passwd", Some(2)).is_err());
        assert!(ns.remap_path("tmp/f", Some(77)).is_err());
    }

    #[test]
    fn test_prepare_without_image() {
        let dir = tempfile::tempdir().unwrap();
        let ns = prepare_mnt_ns(dir.path(), 1, Path::new("/")).unwrap();
        assert!(!ns.has_tree());
    }
}
