//! Image channel templates: file name pattern and magic for every kind of
//! image file.

use std::fmt;

pub mod magic {
    pub const INVENTORY_MAGIC: u32 = 0x58313116;
    pub const FDINFO_MAGIC: u32 = 0x56213732;
    pub const PAGES_MAGIC: u32 = 0x56084025;
    pub const CORE_MAGIC: u32 = 0x55053847;
    pub const PIPES_MAGIC: u32 = 0x56513555;
    pub const PSTREE_MAGIC: u32 = 0x50273030;
    pub const SHMEM_MAGIC: u32 = 0x54123737;
    pub const SIGACT_MAGIC: u32 = 0x55344201;
    pub const UNIXSK_MAGIC: u32 = 0x54373943;
    pub const INETSK_MAGIC: u32 = 0x56443851;
    pub const ITIMERS_MAGIC: u32 = 0x57464056;
    pub const CREDS_MAGIC: u32 = 0x54023547;
    pub const UTSNS_MAGIC: u32 = 0x54473203;
    pub const IPCNS_MAGIC: u32 = 0x53115007;
    pub const REG_FILES_MAGIC: u32 = 0x50363636;
    pub const REMAP_FPATH_MAGIC: u32 = 0x59133954;
    pub const GHOST_FILE_MAGIC: u32 = 0x52583605;
    pub const MNTS_MAGIC: u32 = 0x55563928;
    pub const TCP_STREAM_MAGIC: u32 = 0x51465506;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum ChannelKind {
    Inventory = 0,
    Fdinfo,
    Pages,
    PagesShmem,
    Core,
    Pipes,
    Pstree,
    Shmem,
    Sigact,
    Unixsk,
    Inetsk,
    Itimers,
    Creds,
    Utsns,
    Ipcns,
    RegFiles,
    RemapFpath,
    GhostFile,
    Mnts,
    TcpStream,
}

impl ChannelKind {
    pub const COUNT: usize = 20;

    pub const ALL: [ChannelKind; Self::COUNT] = [
        ChannelKind::Inventory,
        ChannelKind::Fdinfo,
        ChannelKind::Pages,
        ChannelKind::PagesShmem,
        ChannelKind::Core,
        ChannelKind::Pipes,
        ChannelKind::Pstree,
        ChannelKind::Shmem,
        ChannelKind::Sigact,
        ChannelKind::Unixsk,
        ChannelKind::Inetsk,
        ChannelKind::Itimers,
        ChannelKind::Creds,
        ChannelKind::Utsns,
        ChannelKind::Ipcns,
        ChannelKind::RegFiles,
        ChannelKind::RemapFpath,
        ChannelKind::GhostFile,
        ChannelKind::Mnts,
        ChannelKind::TcpStream,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn template(self) -> &'static ChannelTemplate {
        &CHANNEL_TEMPLATES[self.index()]
    }

    #[inline]
    pub fn magic(self) -> u32 {
        self.template().magic
    }

    /// Image name for this kind and entity. Patterns without a placeholder
    /// name a global image and ignore the id.
    pub fn image_name(self, id: u32) -> String {
        let fmt = self.template().fmt;
        if let Some(pos) = fmt.find("%d") {
            format!("{}{}{}", &fmt[..pos], id, &fmt[pos + 2..])
        } else if let Some(pos) = fmt.find("%x") {
            format!("{}{:x}{}", &fmt[..pos], id, &fmt[pos + 2..])
        } else {
            fmt.to_string()
        }
    }

    #[inline]
    pub fn is_global(self) -> bool {
        !self.template().fmt.contains('%')
    }

    /// First kind in table order carrying `magic`. Pages and shmem pages
    /// share a tag, the former wins.
    pub fn from_magic(magic: u32) -> Option<ChannelKind> {
        Self::ALL.iter().copied().find(|k| k.magic() == magic)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template().name)
    }
}

pub struct ChannelTemplate {
    pub kind: ChannelKind,
    pub name: &'static str,
    pub fmt: &'static str,
    pub magic: u32,
}

use magic::*;
use ChannelKind::*;

const fn tmpl(kind: ChannelKind, name: &'static str, fmt: &'static str, magic: u32) -> ChannelTemplate {
    ChannelTemplate { kind, name, fmt, magic }
}

/// Indexed by `ChannelKind as usize`.
pub static CHANNEL_TEMPLATES: [ChannelTemplate; ChannelKind::COUNT] = [
    tmpl(Inventory, "inventory", "inventory.img", INVENTORY_MAGIC),
    // info about file descriptors
    tmpl(Fdinfo, "fdinfo", "fdinfo-%d.img", FDINFO_MAGIC),
    // private memory pages data
    tmpl(Pages, "pages", "pages-%d.img", PAGES_MAGIC),
    // shared memory pages data
    tmpl(PagesShmem, "pages-shmem", "pages-shmem-%d.img", PAGES_MAGIC),
    // regs, vmas and such
    tmpl(Core, "core", "core-%d.img", CORE_MAGIC),
    tmpl(Pipes, "pipes", "pipes-%d.img", PIPES_MAGIC),
    // process linkage
    tmpl(Pstree, "pstree", "pstree-%d.img", PSTREE_MAGIC),
    // which memory areas are shared
    tmpl(Shmem, "shmem", "shmem-%d.img", SHMEM_MAGIC),
    tmpl(Sigact, "sigacts", "sigacts-%d.img", SIGACT_MAGIC),
    tmpl(Unixsk, "unixsk", "unixsk-%d.img", UNIXSK_MAGIC),
    tmpl(Inetsk, "inetsk", "inetsk-%d.img", INETSK_MAGIC),
    tmpl(Itimers, "itimers", "itimers-%d.img", ITIMERS_MAGIC),
    tmpl(Creds, "creds", "creds-%d.img", CREDS_MAGIC),
    tmpl(Utsns, "utsns", "utsns-%d.img", UTSNS_MAGIC),
    tmpl(Ipcns, "ipcns", "ipcns-%d.img", IPCNS_MAGIC),
    tmpl(RegFiles, "reg-files", "reg-files.img", REG_FILES_MAGIC),
    tmpl(RemapFpath, "remap-fpath", "remap-fpath.img", REMAP_FPATH_MAGIC),
    tmpl(GhostFile, "ghost-file", "ghost-file-%x.img", GHOST_FILE_MAGIC),
    tmpl(Mnts, "mountpoints", "mountpoints-%d.img", MNTS_MAGIC),
    tmpl(TcpStream, "tcp-stream", "tcp-stream-%x.img", TCP_STREAM_MAGIC),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_indexed_by_kind() {
        for kind in ChannelKind::ALL {
            assert_eq!(kind.template().kind, kind);
        }
    }

    #[test]
    fn test_image_name_substitution() {
        assert_eq!(ChannelKind::Pstree.image_name(1234), "pstree-1234.img");
        assert_eq!(ChannelKind::Pages.image_name(1234), "pages-1234.img");
        assert_eq!(ChannelKind::GhostFile.image_name(255), "ghost-file-ff.img");
        assert_eq!(ChannelKind::Inventory.image_name(1234), "inventory.img");
    }

    #[test]
    fn test_global_kinds() {
        assert!(ChannelKind::Inventory.is_global());
        assert!(ChannelKind::RemapFpath.is_global());
        assert!(!ChannelKind::Core.is_global());
    }

    #[test]
    fn test_from_magic() {
        assert_eq!(ChannelKind::from_magic(PSTREE_MAGIC), Some(ChannelKind::Pstree));
        assert_eq!(ChannelKind::from_magic(PAGES_MAGIC), Some(ChannelKind::Pages));
        assert_eq!(ChannelKind::from_magic(0xdeadbeef), None);
    }
}
