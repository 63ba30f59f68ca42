use std::collections::HashMap;
use std::path::Path;

use crate::criu::image::open_image;
use crate::criu::image_desc::ChannelKind;
use crate::criu::protobuf::pb_read_one_eof;
use crate::error::{CrError, Result};
use crate::proto::PstreeEntry;

const PID_MAX_PATH: &str = "/proc/sys/kernel/pid_max";

#[derive(Debug, Clone)]
pub struct PstreeItem {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    pub sid: u32,
    pub threads: Vec<u32>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl PstreeItem {
    fn from_entry(e: PstreeEntry) -> Self {
        Self {
            pid: e.pid,
            ppid: e.ppid,
            pgid: e.pgid,
            sid: e.sid,
            threads: e.threads,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// Restored process tree. The first item is the root task.
#[derive(Debug, Default)]
pub struct PsTree {
    items: Vec<PstreeItem>,
    by_pid: HashMap<u32, usize>,
}

impl PsTree {
    pub fn root(&self) -> Option<&PstreeItem> {
        self.items.first()
    }

    pub fn root_pid(&self) -> Option<u32> {
        self.root().map(|i| i.pid)
    }

    pub fn get(&self, idx: usize) -> Option<&PstreeItem> {
        self.items.get(idx)
    }

    pub fn lookup(&self, pid: u32) -> Option<&PstreeItem> {
        self.by_pid.get(&pid).map(|&idx| &self.items[idx])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PstreeItem> {
        self.items.iter()
    }

    /// Highest pid or tid in the tree.
    pub fn pid_max(&self) -> u32 {
        self.items
            .iter()
            .flat_map(|i| std::iter::once(i.pid).chain(i.threads.iter().copied()))
            .max()
            .unwrap_or(0)
    }

    fn add(&mut self, item: PstreeItem) -> Result<()> {
        let idx = self.items.len();
        if self.by_pid.insert(item.pid, idx).is_some() {
            return Err(CrError::Pstree(format!("pid {} appears twice", item.pid)));
        }
        self.items.push(item);
        Ok(())
    }

    fn link(&mut self) -> Result<()> {
        for idx in 1..self.items.len() {
            let ppid = self.items[idx].ppid;
            let parent = match self.by_pid.get(&ppid) {
                Some(&p) if p != idx => p,
                _ => {
                    return Err(CrError::Pstree(format!(
                        "no parent {} for {}",
                        ppid, self.items[idx].pid
                    )))
                }
            };
            self.items[idx].parent = Some(parent);
            self.items[parent].children.push(idx);
        }

        // Only the root may lack a path up; anything else is a loop.
        for start in 1..self.items.len() {
            let mut cur = start;
            let mut steps = 0;
            while let Some(p) = self.items[cur].parent {
                cur = p;
                steps += 1;
                if steps > self.items.len() {
                    return Err(CrError::Pstree(format!(
                        "pid {} is not linked to the root",
                        self.items[start].pid
                    )));
                }
            }
            if cur != 0 {
                return Err(CrError::Pstree(format!(
                    "pid {} is not linked to the root",
                    self.items[start].pid
                )));
            }
        }

        Ok(())
    }
}

pub fn read_pstree_image(dir: &Path, entity: u32) -> Result<PsTree> {
    log::info!("Reading image tree");

    let mut img = open_image(dir, ChannelKind::Pstree, entity)?;
    let mut tree = PsTree::default();

    while let Some(e) = pb_read_one_eof::<PstreeEntry>(&mut img)? {
        log::debug!("PSTREE: pid {} ppid {} pgid {} sid {}", e.pid, e.ppid, e.pgid, e.sid);
        tree.add(PstreeItem::from_entry(e))?;
    }

    if tree.is_empty() {
        return Err(CrError::Pstree("empty process tree image".into()));
    }

    tree.link()?;
    Ok(tree)
}

/// The kernel pid limit needed to fit `pid_max`, if the current one doesn't.
fn raised_pid_max(pid_max: u32, kpid_max: u32) -> Result<Option<u32>> {
    if pid_max < kpid_max {
        return Ok(None);
    }
    pid_max
        .checked_add(1)
        .map(Some)
        .ok_or_else(|| CrError::Pstree(format!("pid {} can't fit any kernel pid_max", pid_max)))
}

/// Builds the process tree to be restored and checks it against the
/// kernel's pid limit.
pub fn prepare_pstree(dir: &Path, entity: u32, leader_only: bool) -> Result<PsTree> {
    let mut tree = read_pstree_image(dir, entity)?;

    let root_pid = tree.root_pid().unwrap_or(0);
    if root_pid != entity {
        return Err(CrError::Pstree(format!(
            "image tree is rooted at {}, not {}",
            root_pid, entity
        )));
    }

    if leader_only && tree.len() > 1 {
        log::info!("Restoring the leader only, dropping {} tasks", tree.len() - 1);
        tree.items.truncate(1);
        tree.items[0].children.clear();
        tree.by_pid.retain(|_, idx| *idx == 0);
    }

    let pid_max = tree.pid_max();
    log::debug!("pstree pid_max={}", pid_max);

    if let Ok(contents) = std::fs::read_to_string(PID_MAX_PATH) {
        if let Ok(kpid_max) = contents.trim().parse::<u32>() {
            log::debug!("kernel pid_max={}", kpid_max);
            if let Some(new_pid_max) = raised_pid_max(pid_max, kpid_max)? {
                std::fs::write(PID_MAX_PATH, new_pid_max.to_string()).map_err(|e| {
                    CrError::Pstree(format!("Can't set kernel pid_max={}: {}", new_pid_max, e))
                })?;
                log::info!("kernel pid_max pushed to {}", new_pid_max);
            }
        }
    }

    log::info!("Process tree of {} tasks prepared", tree.len());
    Ok(tree)
}
