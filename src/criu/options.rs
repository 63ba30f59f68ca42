//! Options for dump/restore operations.
//!
//! Built once by the command line layer and handed down by reference.

use std::path::PathBuf;

use crate::error::{CrError, Result};

/// What happens to the dumped task once the dump is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFinalState {
    #[default]
    Kill,
    Run,
}

/// Network locking method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum NetworkLockMethod {
    #[default]
    Iptables = 0,
    Nftables,
    Skip,
}

impl NetworkLockMethod {
    pub fn from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(NetworkLockMethod::Iptables),
            1 => Some(NetworkLockMethod::Nftables),
            2 => Some(NetworkLockMethod::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrOptions {
    pub final_state: TaskFinalState,
    /// Only the leader, not its whole subtree.
    pub leader_only: bool,
    pub show_pages_content: bool,
    pub show_dump_file: Option<PathBuf>,
    pub restore_detach: bool,
    /// CLONE_NEW* flags of the namespaces to dump/restore.
    pub namespaces_flags: u64,
    pub imgs_dir: PathBuf,
    /// Directory the restored mount namespace is anchored at.
    pub root: PathBuf,
    pub output: Option<PathBuf>,
    pub network_lock_method: NetworkLockMethod,
    pub tcp_close: bool,
    pub display_stats: bool,
}

impl Default for CrOptions {
    fn default() -> Self {
        Self {
            final_state: TaskFinalState::Kill,
            leader_only: false,
            show_pages_content: false,
            show_dump_file: None,
            restore_detach: false,
            namespaces_flags: 0,
            imgs_dir: PathBuf::from("."),
            root: PathBuf::from("/"),
            output: None,
            network_lock_method: NetworkLockMethod::Iptables,
            tcp_close: false,
            display_stats: false,
        }
    }
}

/// Parses a comma separated namespace list, e.g. `uts,ipc`.
pub fn parse_ns_string(s: &str) -> Result<u64> {
    let mut flags = 0u64;

    for ns in s.split(',') {
        flags |= match ns {
            "uts" => libc::CLONE_NEWUTS as u64,
            "ipc" => libc::CLONE_NEWIPC as u64,
            _ => {
                log::error!("Unknown namespace '{}'", ns);
                return Err(CrError::Options(format!("unknown namespace '{}'", ns)));
            }
        };
    }

    Ok(flags)
}
