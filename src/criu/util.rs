use std::path::{Component, Path, PathBuf};

/// Lexically resolves `..`; it never climbs above the first component.
fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Normal(s) => out.push(s),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Path of `path` relative to `sub_path`, ignoring leading slashes, repeated
/// slashes and `.` components. `None` when `path` is not below `sub_path`.
pub fn get_relative_path(path: impl AsRef<Path>, sub_path: impl AsRef<Path>) -> Option<PathBuf> {
    let path = normalize(path.as_ref());
    let sub = normalize(sub_path.as_ref());
    path.strip_prefix(&sub).ok().map(Path::to_path_buf)
}

#[inline]
pub fn is_sub_path(path: impl AsRef<Path>, sub_path: impl AsRef<Path>) -> bool {
    get_relative_path(path, sub_path).is_some()
}

/// Joins a namespace-absolute path onto `root`.
pub fn path_under_root(root: &Path, path: impl AsRef<Path>) -> PathBuf {
    root.join(normalize(path.as_ref()))
}
