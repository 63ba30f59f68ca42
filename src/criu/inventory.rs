use std::path::Path;

use crate::criu::image::{open_image, ImageSet, KindMask, CORE_KINDS};
use crate::criu::image_desc::ChannelKind;
use crate::criu::options::{CrOptions, NetworkLockMethod};
use crate::criu::protobuf::{pb_read_one, pb_write_one};
use crate::error::{CrError, Result};
use crate::proto::InventoryEntry;

pub const CRTOOLS_IMAGES_V1: u32 = 1;
/// Images carrying the extra common magic in the head.
pub const CRTOOLS_IMAGES_V1_1: u32 = 2;

/// What the restore learns from `inventory.img`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryInfo {
    pub img_version: u32,
    pub ns_per_id: bool,
    pub root_cg_set: Option<u32>,
    pub tcp_close: bool,
    pub network_lock_method: Option<NetworkLockMethod>,
    pub dump_run_id: Option<String>,
}

/// Run ids name the nftables lock table, so they are kept to `[A-Za-z0-9-]+`.
pub fn is_valid_run_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn check_entry(he: &InventoryEntry, opts: &CrOptions) -> std::result::Result<InventoryInfo, String> {
    if he.fdinfo_per_id != Some(true) {
        return Err("Too old image, no longer supported".into());
    }

    match he.img_version {
        CRTOOLS_IMAGES_V1 | CRTOOLS_IMAGES_V1_1 => {}
        ver => return Err(format!("Not supported images version {}", ver)),
    }

    if he.root_cg_set == Some(0) {
        return Err("Corrupted root cgset".into());
    }

    let tcp_close = he.tcp_close == Some(true);
    if tcp_close && !opts.tcp_close {
        return Err("Need to set the --tcp-close options.".into());
    }

    let network_lock_method = match he.network_lock_method {
        None => None,
        Some(raw) => Some(
            NetworkLockMethod::from_raw(raw)
                .ok_or_else(|| format!("Unknown network lock method {}", raw))?,
        ),
    };

    if let Some(id) = he.dump_criu_run_id.as_deref() {
        if !is_valid_run_id(id) {
            return Err(format!("Malformed dump run id {:?}", id));
        }
    }

    Ok(InventoryInfo {
        img_version: he.img_version,
        ns_per_id: he.ns_per_id.unwrap_or(false),
        root_cg_set: he.root_cg_set,
        tcp_close,
        network_lock_method,
        dump_run_id: he.dump_criu_run_id.clone(),
    })
}

/// Verifies the inventory and the core channels of `entity` before anything
/// with side effects runs.
pub fn check_img_inventory(dir: &Path, entity: u32, opts: &CrOptions) -> Result<InventoryInfo> {
    let he: InventoryEntry = open_image(dir, ChannelKind::Inventory, 0)
        .and_then(|mut img| pb_read_one(&mut img))
        .map_err(|e| CrError::Inventory(format!("Failed to read inventory image: {}", e)))?;

    let info = check_entry(&he, opts).map_err(|msg| {
        log::error!("{}", msg);
        CrError::Inventory(msg)
    })?;

    let mut set = ImageSet::open_for_restore(dir, entity, CORE_KINDS)
        .map_err(|e| CrError::Inventory(format!("core images of {}: {}", entity, e)))?;
    set.close();

    log::info!(
        "Image version {} checked, core images of {} in place",
        info.img_version,
        entity
    );
    Ok(info)
}

/// Writes `inventory.img` for a dump.
pub fn write_img_inventory(dir: &Path, opts: &CrOptions, run_id: &str) -> Result<()> {
    let he = InventoryEntry {
        img_version: CRTOOLS_IMAGES_V1_1,
        fdinfo_per_id: Some(true),
        ns_per_id: Some(true),
        root_cg_set: None,
        tcp_close: opts.tcp_close.then_some(true),
        network_lock_method: Some(opts.network_lock_method as u32),
        dump_criu_run_id: Some(run_id.to_string()),
    };

    log::info!("Writing inventory (run id {})", run_id);

    let mut set = ImageSet::open_for_dump(dir, 0, KindMask::bit(ChannelKind::Inventory))?;
    if let Some(img) = set.get_mut(ChannelKind::Inventory) {
        pb_write_one(img, &he)?;
    }
    set.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_core(dir: &Path, entity: u32) {
        ImageSet::open_for_dump(dir, entity, CORE_KINDS).unwrap();
    }

    fn write_entry(dir: &Path, he: &InventoryEntry) {
        let mut set = ImageSet::open_for_dump(dir, 0, KindMask::bit(ChannelKind::Inventory)).unwrap();
        pb_write_one(set.get_mut(ChannelKind::Inventory).unwrap(), he).unwrap();
    }

    fn entry() -> InventoryEntry {
        InventoryEntry {
            img_version: CRTOOLS_IMAGES_V1_1,
            fdinfo_per_id: Some(true),
            ns_per_id: None,
            root_cg_set: None,
            tcp_close: None,
            network_lock_method: None,
            dump_criu_run_id: None,
        }
    }

    #[test]
    fn test_write_then_check() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CrOptions::default();
        write_img_inventory(dir.path(), &opts, "run-1").unwrap();
        write_core(dir.path(), 10);

        let info = check_img_inventory(dir.path(), 10, &opts).unwrap();
        assert_eq!(info.img_version, CRTOOLS_IMAGES_V1_1);
        assert_eq!(info.dump_run_id.as_deref(), Some("run-1"));
        assert_eq!(info.network_lock_method, Some(NetworkLockMethod::Iptables));
    }

    #[test]
    fn test_missing_inventory() {
        let dir = tempfile::tempdir().unwrap();
        write_core(dir.path(), 10);
        assert!(matches!(
            check_img_inventory(dir.path(), 10, &CrOptions::default()),
            Err(CrError::Inventory(_))
        ));
    }

    #[test]
    fn test_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), &InventoryEntry { img_version: 7, ..entry() });
        write_core(dir.path(), 10);
        assert!(check_img_inventory(dir.path(), 10, &CrOptions::default()).is_err());
    }

    #[test]
    fn test_old_image() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), &InventoryEntry { fdinfo_per_id: None, ..entry() });
        write_core(dir.path(), 10);
        assert!(check_img_inventory(dir.path(), 10, &CrOptions::default()).is_err());
    }

    #[test]
    fn test_tcp_close_required() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), &InventoryEntry { tcp_close: Some(true), ..entry() });
        write_core(dir.path(), 10);

        assert!(check_img_inventory(dir.path(), 10, &CrOptions::default()).is_err());

        let opts = CrOptions { tcp_close: true, ..Default::default() };
        assert!(check_img_inventory(dir.path(), 10, &opts).unwrap().tcp_close);
    }

    #[test]
    fn test_run_id_checked() {
        assert!(is_valid_run_id("1a2b-4242"));
        assert!(!is_valid_run_id(""));
        assert!(!is_valid_run_id("x'; touch /tmp/pwned; echo '"));

        let dir = tempfile::tempdir().unwrap();
        let bad = Some("x'; touch /tmp/pwned; echo '".to_string());
        write_entry(dir.path(), &InventoryEntry { dump_criu_run_id: bad, ..entry() });
        write_core(dir.path(), 10);
        assert!(matches!(
            check_img_inventory(dir.path(), 10, &CrOptions::default()),
            Err(CrError::Inventory(_))
        ));
    }

    #[test]
    fn test_missing_core_images() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), &entry());
        write_core(dir.path(), 10);
        assert!(matches!(
            check_img_inventory(dir.path(), 11, &CrOptions::default()),
            Err(CrError::Inventory(_))
        ));
    }
}
