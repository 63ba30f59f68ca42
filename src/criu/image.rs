//! Image channel sets.
//!
//! The files describing one checkpointed entity are opened together as a
//! set. A set is built either for dump, where every file is created afresh
//! and stamped with its magic, or for restore, where every file is opened
//! and its magic verified. Either all requested channels end up open or the
//! handles opened on the way are closed again before the error is returned.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::ops::BitOr;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::criu::image_desc::ChannelKind;
use crate::error::{CrError, Result};

pub const CR_FD_PERM: u32 = 0o600;

/// Bitmask of wanted channel kinds.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct KindMask(u32);

impl KindMask {
    pub const EMPTY: KindMask = KindMask(0);

    #[inline]
    pub const fn bit(kind: ChannelKind) -> KindMask {
        KindMask(1 << kind as usize)
    }

    pub const fn of(kinds: &[ChannelKind]) -> KindMask {
        let mut bits = 0;
        let mut i = 0;
        while i < kinds.len() {
            bits |= 1 << kinds[i] as usize;
            i += 1;
        }
        KindMask(bits)
    }

    #[inline]
    pub fn contains(self, kind: ChannelKind) -> bool {
        self.0 & Self::bit(kind).0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = ChannelKind> {
        ChannelKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl BitOr for KindMask {
    type Output = KindMask;

    fn bitor(self, rhs: KindMask) -> KindMask {
        KindMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for KindMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Per-task channels written by dump and required by restore.
pub const TASK_KINDS: KindMask = KindMask::of(&[
    ChannelKind::Fdinfo,
    ChannelKind::Pages,
    ChannelKind::Core,
    ChannelKind::Pipes,
    ChannelKind::Sigact,
    ChannelKind::Itimers,
    ChannelKind::Creds,
]);

/// Channels whose presence is checked before restore touches anything.
pub const CORE_KINDS: KindMask = KindMask::of(&[ChannelKind::Core, ChannelKind::Pstree]);

/// One open channel. The leading magic has already been written or checked,
/// the file offset sits right after it.
pub struct Image {
    kind: ChannelKind,
    path: PathBuf,
    file: File,
}

impl Image {
    fn create(dir: &Path, kind: ChannelKind, id: u32) -> Result<Image> {
        let path = image_path(dir, kind, id)
            .map_err(|(path, source)| CrError::ChannelCreate { path, source })?;

        if let Err(source) = fs::remove_file(&path) {
            if source.kind() != io::ErrorKind::NotFound {
                log::error!("Unable to unlink {}: {}", path.display(), source);
                return Err(CrError::ChannelCreate { path, source });
            }
        }

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(CR_FD_PERM)
            .open(&path)
        {
            Ok(f) => f,
            Err(source) => {
                log::error!("Unable to open {}: {}", path.display(), source);
                return Err(CrError::ChannelCreate { path, source });
            }
        };

        log::debug!("Opened {} with {}", path.display(), file.as_raw_fd());

        if let Err(source) = file.write_all(&kind.magic().to_ne_bytes()) {
            return Err(CrError::ChannelCreate { path, source });
        }

        Ok(Image { kind, path, file })
    }

    fn open_verify(dir: &Path, kind: ChannelKind, id: u32) -> Result<Image> {
        let path = image_path(dir, kind, id)
            .map_err(|(path, source)| CrError::ChannelOpen { path, source })?;

        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(source) => {
                log::error!("Unable to open {}: {}", path.display(), source);
                return Err(CrError::ChannelOpen { path, source });
            }
        };

        log::debug!("Opened {} with {}", path.display(), file.as_raw_fd());

        let mut buf = [0u8; 4];
        let got = read_full(&mut file, &mut buf)
            .map_err(|source| CrError::ChannelOpen { path: path.clone(), source })?;

        // A short head can't carry a valid tag; report what was there.
        let found = u32::from_ne_bytes(buf);
        if got < buf.len() || found != kind.magic() {
            log::error!("Magic doesn't match for {}", path.display());
            return Err(CrError::MagicMismatch {
                path,
                expected: kind.magic(),
                found,
            });
        }

        Ok(Image { kind, path, file })
    }

    /// Opens any image file read-only, telling its kind by the magic.
    pub fn open_by_path(path: &Path) -> Result<Image> {
        let mut file = File::open(path).map_err(|source| CrError::ChannelOpen {
            path: path.to_path_buf(),
            source,
        })?;

        let mut buf = [0u8; 4];
        let got = read_full(&mut file, &mut buf)?;
        let magic = u32::from_ne_bytes(buf);

        let kind = match ChannelKind::from_magic(magic) {
            Some(kind) if got == buf.len() => kind,
            _ => {
                return Err(CrError::InvalidImage {
                    reason: format!("{}: unknown magic {:#010x}", path.display(), magic),
                })
            }
        };

        Ok(Image {
            kind,
            path: path.to_path_buf(),
            file,
        })
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Size of the image file, magic included.
    pub fn raw_size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

fn image_path(dir: &Path, kind: ChannelKind, id: u32) -> std::result::Result<PathBuf, (PathBuf, io::Error)> {
    let path = dir.join(kind.image_name(id));
    if path.as_os_str().len() >= libc::PATH_MAX as usize {
        let err = io::Error::new(io::ErrorKind::InvalidInput, "image path too long");
        return Err((path, err));
    }
    Ok(path)
}

/// Reads until `buf` is full or EOF, returning the number of bytes read.
pub(crate) fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut off = 0;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(off)
}

/// The set of open channels for one entity, indexed by kind.
pub struct ImageSet {
    entity: u32,
    images: [Option<Image>; ChannelKind::COUNT],
}

impl ImageSet {
    fn empty(entity: u32) -> Self {
        Self {
            entity,
            images: std::array::from_fn(|_| None),
        }
    }

    /// Creates a fresh set of dump images. On failure nothing stays open.
    pub fn open_for_dump(dir: &Path, entity: u32, wanted: KindMask) -> Result<ImageSet> {
        let mut set = Self::empty(entity);
        set.extend_for_dump(dir, entity, wanted)?;
        Ok(set)
    }

    /// Adds the wanted kinds that aren't open yet. On failure only the
    /// channels opened by this call are closed; the ones the set already
    /// had stay untouched and the set remains the caller's to close.
    pub fn extend_for_dump(&mut self, dir: &Path, entity: u32, wanted: KindMask) -> Result<()> {
        let mut opened: Vec<ChannelKind> = Vec::new();

        for kind in wanted.iter() {
            if self.images[kind.index()].is_some() {
                continue;
            }

            match Image::create(dir, kind, entity) {
                Ok(img) => {
                    self.images[kind.index()] = Some(img);
                    opened.push(kind);
                }
                Err(e) => {
                    for k in opened {
                        self.close_one(k);
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Opens and verifies existing images. Any failure closes the whole set.
    pub fn open_for_restore(dir: &Path, entity: u32, wanted: KindMask) -> Result<ImageSet> {
        let mut set = Self::empty(entity);

        for kind in wanted.iter() {
            match Image::open_verify(dir, kind, entity) {
                Ok(img) => set.images[kind.index()] = Some(img),
                Err(e) => {
                    set.close();
                    return Err(e);
                }
            }
        }

        Ok(set)
    }

    #[inline]
    pub fn entity(&self) -> u32 {
        self.entity
    }

    pub fn get(&self, kind: ChannelKind) -> Option<&Image> {
        self.images[kind.index()].as_ref()
    }

    pub fn get_mut(&mut self, kind: ChannelKind) -> Option<&mut Image> {
        self.images[kind.index()].as_mut()
    }

    pub fn contains(&self, kind: ChannelKind) -> bool {
        self.images[kind.index()].is_some()
    }

    pub fn open_count(&self) -> usize {
        self.images.iter().filter(|i| i.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter().flatten()
    }

    fn close_one(&mut self, kind: ChannelKind) {
        if let Some(img) = self.images[kind.index()].take() {
            log::debug!("Closed {}/{}", kind.index(), img.file.as_raw_fd());
        }
    }

    /// Closes every open channel. Calling it again is a no-op.
    pub fn close(&mut self) {
        for kind in ChannelKind::ALL {
            self.close_one(kind);
        }
    }
}

impl Drop for ImageSet {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes and releases a set; `None` is left alone.
pub fn close_image_set(set: &mut Option<ImageSet>) {
    if let Some(mut s) = set.take() {
        s.close();
    }
}

/// Opens one image for reading if it exists. A missing file means the dump
/// had nothing of that kind.
pub fn open_image_optional(dir: &Path, kind: ChannelKind, id: u32) -> Result<Option<Image>> {
    if !dir.join(kind.image_name(id)).try_exists()? {
        log::debug!("No {} image for {}", kind, id);
        return Ok(None);
    }
    Image::open_verify(dir, kind, id).map(Some)
}

/// Opens one image for reading; it has to exist.
pub fn open_image(dir: &Path, kind: ChannelKind, id: u32) -> Result<Image> {
    Image::open_verify(dir, kind, id)
}
