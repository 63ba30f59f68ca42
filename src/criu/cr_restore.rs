//! Restore preparation.
//!
//! A run is an ordered list of stages. Each stage consumes what earlier
//! ones left in the [`RestoreContext`]; the first failure stops the run
//! and nothing done before it is unwound.

use std::fmt;
use std::path::Path;

use crate::criu::files_reg::{collect_remaps_and_regfiles, retire_remaps, RemapRecord, RetireReport};
use crate::criu::inventory::{check_img_inventory, InventoryInfo};
use crate::criu::mount::{prepare_mnt_ns, MountNamespace};
use crate::criu::netfilter::{self, ConnAddrs};
use crate::criu::options::{CrOptions, NetworkLockMethod};
use crate::criu::pstree::{prepare_pstree, PsTree};
use crate::criu::rst_malloc::RstMem;
use crate::criu::sk_tcp::{prepare_tcp_sockets, TcpRepairSock};
use crate::criu::sockets::{collect_inet_sockets, InetSkInfo};
use crate::criu::stats::RestoreStats;
use crate::error::{CrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Inventory,
    CollectRemaps,
    PreparePstree,
    PrepareMntNs,
    /// Inet collection, switch to private memory, TCP repair state.
    PrepareSockets,
    /// Inet collection only.
    CollectSockets,
    NetworkLock,
    NetworkUnlock,
    DeleteRemaps,
}

impl StageId {
    pub fn name(self) -> &'static str {
        match self {
            StageId::Inventory => "inventory",
            StageId::CollectRemaps => "collect-remaps",
            StageId::PreparePstree => "prepare-pstree",
            StageId::PrepareMntNs => "prepare-mntns",
            StageId::PrepareSockets => "prepare-sockets",
            StageId::CollectSockets => "collect-sockets",
            StageId::NetworkLock => "network-lock",
            StageId::NetworkUnlock => "network-unlock",
            StageId::DeleteRemaps => "delete-remaps",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stage and the stages that must have completed before it.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub id: StageId,
    pub requires: &'static [StageId],
}

const fn stage(id: StageId, requires: &'static [StageId]) -> StageSpec {
    StageSpec { id, requires }
}

pub const RESTORE_STAGES: &[StageSpec] = &[
    stage(StageId::Inventory, &[]),
    stage(StageId::CollectRemaps, &[StageId::Inventory]),
    stage(StageId::PreparePstree, &[StageId::CollectRemaps]),
    stage(StageId::PrepareMntNs, &[StageId::PreparePstree]),
    stage(StageId::PrepareSockets, &[StageId::PrepareMntNs]),
    stage(StageId::NetworkLock, &[StageId::PrepareSockets]),
    stage(
        StageId::DeleteRemaps,
        &[StageId::CollectRemaps, StageId::PrepareMntNs, StageId::NetworkLock],
    ),
];

/// Cleanup after a restore that didn't make it.
pub const GC_STAGES: &[StageSpec] = &[
    stage(StageId::CollectRemaps, &[]),
    stage(StageId::PrepareMntNs, &[StageId::CollectRemaps]),
    stage(StageId::CollectSockets, &[StageId::PrepareMntNs]),
    stage(StageId::NetworkUnlock, &[StageId::CollectSockets]),
    stage(StageId::DeleteRemaps, &[StageId::CollectRemaps, StageId::PrepareMntNs]),
];

/// Progress of one run. Only ever grows.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub completed: Vec<StageId>,
    pub failed: Option<StageId>,
}

/// Everything a run reads and produces.
pub struct RestoreContext<'a> {
    pub opts: &'a CrOptions,
    pub entity: u32,
    pub inventory: Option<InventoryInfo>,
    pub remaps: Vec<RemapRecord>,
    pub pstree: Option<PsTree>,
    pub mntns: Option<MountNamespace>,
    pub rst_mem: RstMem,
    pub inet_sockets: Vec<InetSkInfo>,
    pub tcp_repair: Vec<TcpRepairSock>,
    pub retire_report: Option<RetireReport>,
    pub stats: RestoreStats,
    pub state: PipelineState,
}

impl<'a> RestoreContext<'a> {
    pub fn new(opts: &'a CrOptions, entity: u32) -> Self {
        Self {
            opts,
            entity,
            inventory: None,
            remaps: Vec::new(),
            pstree: None,
            mntns: None,
            rst_mem: RstMem::new(),
            inet_sockets: Vec::new(),
            tcp_repair: Vec::new(),
            retire_report: None,
            stats: RestoreStats::new(),
            state: PipelineState::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.opts.imgs_dir
    }

    /// Mount namespace id. Without a process tree it is the entity itself.
    fn ns_id(&self) -> u32 {
        self.pstree.as_ref().and_then(|t| t.root_pid()).unwrap_or(self.entity)
    }

    /// The lock method recorded at dump time wins over the command line.
    fn lock_method(&self) -> NetworkLockMethod {
        self.inventory
            .as_ref()
            .and_then(|i| i.network_lock_method)
            .unwrap_or(self.opts.network_lock_method)
    }

    fn nft_table_id(&self) -> String {
        match self.inventory.as_ref().and_then(|i| i.dump_run_id.clone()) {
            Some(id) => id,
            None => self.ns_id().to_string(),
        }
    }
}

/// The parts of the restore that touch the rest of the system.
pub trait RestoreOps {
    fn check_inventory(&mut self, dir: &Path, entity: u32, opts: &CrOptions) -> Result<InventoryInfo>;

    fn prepare_pstree(&mut self, dir: &Path, entity: u32, opts: &CrOptions) -> Result<PsTree>;

    fn prepare_mnt_ns(&mut self, dir: &Path, ns_id: u32, opts: &CrOptions) -> Result<MountNamespace>;

    fn collect_inet_sockets(&mut self, dir: &Path, entity: u32, mem: &mut RstMem) -> Result<Vec<InetSkInfo>>;

    fn prepare_tcp_sockets(
        &mut self,
        dir: &Path,
        sockets: &[InetSkInfo],
        mem: &mut RstMem,
        opts: &CrOptions,
    ) -> Result<Vec<TcpRepairSock>>;

    fn network_lock(&mut self, method: NetworkLockMethod, conns: &[ConnAddrs], table_id: &str) -> Result<()>;

    fn network_unlock(&mut self, method: NetworkLockMethod, conns: &[ConnAddrs], table_id: &str) -> Result<()>;
}

/// Works on the real images, filesystem and firewall.
#[derive(Debug, Default)]
pub struct HostRestoreOps;

impl RestoreOps for HostRestoreOps {
    fn check_inventory(&mut self, dir: &Path, entity: u32, opts: &CrOptions) -> Result<InventoryInfo> {
        check_img_inventory(dir, entity, opts)
    }

    fn prepare_pstree(&mut self, dir: &Path, entity: u32, opts: &CrOptions) -> Result<PsTree> {
        prepare_pstree(dir, entity, opts.leader_only)
    }

    fn prepare_mnt_ns(&mut self, dir: &Path, ns_id: u32, opts: &CrOptions) -> Result<MountNamespace> {
        prepare_mnt_ns(dir, ns_id, &opts.root)
    }

    fn collect_inet_sockets(&mut self, dir: &Path, entity: u32, mem: &mut RstMem) -> Result<Vec<InetSkInfo>> {
        collect_inet_sockets(dir, entity, mem)
    }

    fn prepare_tcp_sockets(
        &mut self,
        dir: &Path,
        sockets: &[InetSkInfo],
        mem: &mut RstMem,
        opts: &CrOptions,
    ) -> Result<Vec<TcpRepairSock>> {
        prepare_tcp_sockets(dir, sockets, mem, opts)
    }

    fn network_lock(&mut self, method: NetworkLockMethod, conns: &[ConnAddrs], table_id: &str) -> Result<()> {
        netfilter::network_lock(method, conns, table_id)
    }

    fn network_unlock(&mut self, method: NetworkLockMethod, conns: &[ConnAddrs], table_id: &str) -> Result<()> {
        netfilter::network_unlock(method, conns, table_id)
    }
}

pub struct Pipeline {
    stages: &'static [StageSpec],
}

impl Pipeline {
    /// Checks that every stage appears once and after all it requires.
    pub fn new(stages: &'static [StageSpec]) -> Result<Self> {
        for (pos, spec) in stages.iter().enumerate() {
            let earlier = &stages[..pos];

            if earlier.iter().any(|s| s.id == spec.id) {
                return Err(CrError::PipelineOrder(format!("{} appears twice", spec.id)));
            }

            if let Some(req) = spec.requires.iter().find(|r| !earlier.iter().any(|s| s.id == **r)) {
                return Err(CrError::PipelineOrder(format!("{} needs {} to run first", spec.id, req)));
            }
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.stages.iter().map(|s| s.id)
    }

    /// Runs every stage in order, stopping at the first failure.
    pub fn run(&self, ctx: &mut RestoreContext<'_>, ops: &mut dyn RestoreOps) -> Result<()> {
        for spec in self.stages {
            log::info!("Stage {}", spec.id);

            ctx.stats.timing_start(spec.id);
            let ret = run_stage(spec.id, ctx, ops);
            ctx.stats.timing_stop(spec.id);

            if let Err(e) = ret {
                log::error!("Stage {} failed: {}", spec.id, e);
                ctx.state.failed = Some(spec.id);
                return Err(CrError::Stage {
                    stage: spec.id,
                    source: Box::new(e),
                });
            }

            ctx.state.completed.push(spec.id);
        }

        Ok(())
    }
}

fn established_conns(sockets: &[InetSkInfo]) -> Result<Vec<ConnAddrs>> {
    sockets
        .iter()
        .filter(|sk| sk.is_established_tcp())
        .map(ConnAddrs::from_inet)
        .collect()
}

fn run_stage(id: StageId, ctx: &mut RestoreContext<'_>, ops: &mut dyn RestoreOps) -> Result<()> {
    let opts = ctx.opts;
    let dir = opts.imgs_dir.as_path();

    match id {
        StageId::Inventory => {
            ctx.inventory = Some(ops.check_inventory(dir, ctx.entity, opts)?);
        }
        StageId::CollectRemaps => {
            ctx.remaps = collect_remaps_and_regfiles(dir)?;
        }
        StageId::PreparePstree => {
            ctx.pstree = Some(ops.prepare_pstree(dir, ctx.entity, opts)?);
        }
        StageId::PrepareMntNs => {
            ctx.mntns = Some(ops.prepare_mnt_ns(dir, ctx.ns_id(), opts)?);
        }
        StageId::PrepareSockets => {
            ctx.inet_sockets = ops.collect_inet_sockets(dir, ctx.entity, &mut ctx.rst_mem)?;
            ctx.rst_mem.switch_to_private();
            ctx.tcp_repair = ops.prepare_tcp_sockets(dir, &ctx.inet_sockets, &mut ctx.rst_mem, opts)?;
        }
        StageId::CollectSockets => {
            ctx.inet_sockets = ops.collect_inet_sockets(dir, ctx.entity, &mut ctx.rst_mem)?;
        }
        StageId::NetworkLock => {
            let conns = ctx
                .tcp_repair
                .iter()
                .map(ConnAddrs::from_repair)
                .collect::<Result<Vec<_>>>()?;
            ops.network_lock(ctx.lock_method(), &conns, &ctx.nft_table_id())?;
        }
        StageId::NetworkUnlock => {
            let conns = if opts.tcp_close {
                Vec::new()
            } else {
                established_conns(&ctx.inet_sockets)?
            };
            ops.network_unlock(ctx.lock_method(), &conns, &ctx.nft_table_id())?;
        }
        StageId::DeleteRemaps => {
            let records = std::mem::take(&mut ctx.remaps);
            let host;
            let mntns = match &ctx.mntns {
                Some(ns) => ns,
                None => {
                    host = MountNamespace::host(&opts.root);
                    &host
                }
            };

            let report = retire_remaps(records, mntns);
            if !report.is_clean() {
                log::warn!("{} remaps couldn't be removed", report.failures.len());
            }
            ctx.retire_report = Some(report);
        }
    }

    Ok(())
}

fn run_pipeline<'a>(
    stages: &'static [StageSpec],
    opts: &'a CrOptions,
    entity: u32,
    ops: &mut dyn RestoreOps,
) -> Result<RestoreContext<'a>> {
    let pipeline = Pipeline::new(stages)?;
    let mut ctx = RestoreContext::new(opts, entity);

    let ret = pipeline.run(&mut ctx, ops);
    if opts.display_stats {
        ctx.stats.display_stats();
    }

    ret.map(|_| ctx)
}

/// Prepares the restore of the tree rooted at `entity`.
pub fn cr_restore_tasks<'a>(opts: &'a CrOptions, entity: u32, ops: &mut dyn RestoreOps) -> Result<RestoreContext<'a>> {
    log::info!("Preparing restore of {} from {}", entity, opts.imgs_dir.display());
    let ctx = run_pipeline(RESTORE_STAGES, opts, entity, ops)?;
    log::info!("Restore of {} prepared", entity);
    Ok(ctx)
}

/// Removes what a failed restore of `entity` left behind.
pub fn cr_garbage_collect<'a>(opts: &'a CrOptions, entity: u32, ops: &mut dyn RestoreOps) -> Result<RestoreContext<'a>> {
    log::info!("Collecting garbage of {} from {}", entity, opts.imgs_dir.display());
    run_pipeline(GC_STAGES, opts, entity, ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
        fail_at: Option<&'static str>,
        root: std::path::PathBuf,
    }

    impl Recorder {
        fn hit(&mut self, name: &'static str) -> Result<()> {
            self.calls.push(name);
            if self.fail_at == Some(name) {
                return Err(CrError::Socket(format!("{} failed", name)));
            }
            Ok(())
        }
    }

    impl RestoreOps for Recorder {
        fn check_inventory(&mut self, _: &Path, _: u32, _: &CrOptions) -> Result<InventoryInfo> {
            self.hit("check_inventory")?;
            Ok(InventoryInfo {
                img_version: 2,
                ns_per_id: true,
                root_cg_set: None,
                tcp_close: false,
                network_lock_method: Some(NetworkLockMethod::Skip),
                dump_run_id: None,
            })
        }

        fn prepare_pstree(&mut self, _: &Path, _: u32, _: &CrOptions) -> Result<PsTree> {
            self.hit("prepare_pstree")?;
            Ok(PsTree::default())
        }

        fn prepare_mnt_ns(&mut self, _: &Path, _: u32, _: &CrOptions) -> Result<MountNamespace> {
            self.hit("prepare_mnt_ns")?;
            Ok(MountNamespace::host(&self.root))
        }

        fn collect_inet_sockets(&mut self, _: &Path, _: u32, mem: &mut RstMem) -> Result<Vec<InetSkInfo>> {
            self.hit("collect_inet_sockets")?;
            assert!(!mem.is_private());
            Ok(Vec::new())
        }

        fn prepare_tcp_sockets(
            &mut self,
            _: &Path,
            _: &[InetSkInfo],
            mem: &mut RstMem,
            _: &CrOptions,
        ) -> Result<Vec<TcpRepairSock>> {
            self.hit("prepare_tcp_sockets")?;
            assert!(mem.is_private());
            Ok(Vec::new())
        }

        fn network_lock(&mut self, method: NetworkLockMethod, _: &[ConnAddrs], _: &str) -> Result<()> {
            assert_eq!(method, NetworkLockMethod::Skip);
            self.hit("network_lock")
        }

        fn network_unlock(&mut self, _: NetworkLockMethod, _: &[ConnAddrs], _: &str) -> Result<()> {
            self.hit("network_unlock")
        }
    }

    fn setup() -> (tempfile::TempDir, CrOptions, Recorder) {
        let dir = tempfile::tempdir().unwrap();
        let opts = CrOptions {
            imgs_dir: dir.path().to_path_buf(),
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let ops = Recorder {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        (dir, opts, ops)
    }

    #[test]
    fn test_restore_stage_order() {
        let (_dir, opts, mut ops) = setup();

        let ctx = cr_restore_tasks(&opts, 1, &mut ops).unwrap();
        assert_eq!(
            ops.calls,
            vec![
                "check_inventory",
                "prepare_pstree",
                "prepare_mnt_ns",
                "collect_inet_sockets",
                "prepare_tcp_sockets",
                "network_lock",
            ]
        );
        assert_eq!(ctx.state.completed, Pipeline::new(RESTORE_STAGES).unwrap().stages().collect::<Vec<_>>());
        assert!(ctx.state.failed.is_none());
        assert!(ctx.retire_report.unwrap().is_clean());
    }

    #[test]
    fn test_short_circuit() {
        let (_dir, opts, mut ops) = setup();
        ops.fail_at = Some("prepare_mnt_ns");

        let pipeline = Pipeline::new(RESTORE_STAGES).unwrap();
        let mut ctx = RestoreContext::new(&opts, 1);
        let err = pipeline.run(&mut ctx, &mut ops).unwrap_err();

        assert!(matches!(err, CrError::Stage { stage: StageId::PrepareMntNs, .. }));
        assert!(matches!(err.root_cause(), CrError::Socket(_)));
        assert_eq!(ops.calls, vec!["check_inventory", "prepare_pstree", "prepare_mnt_ns"]);
        assert_eq!(
            ctx.state.completed,
            vec![StageId::Inventory, StageId::CollectRemaps, StageId::PreparePstree]
        );
        assert_eq!(ctx.state.failed, Some(StageId::PrepareMntNs));
        assert!(ctx.retire_report.is_none());
    }

    #[test]
    fn test_inventory_failure_stops_everything() {
        let (_dir, opts, mut ops) = setup();
        ops.fail_at = Some("check_inventory");

        assert!(cr_restore_tasks(&opts, 1, &mut ops).is_err());
        assert_eq!(ops.calls, vec!["check_inventory"]);
    }

    #[test]
    fn test_broken_remap_image_stops_after_inventory() {
        use crate::criu::image::{ImageSet, KindMask};
        use crate::criu::image_desc::ChannelKind;
        use std::io::Write;

        let (dir, opts, mut ops) = setup();

        // entry header promising more bytes than the file holds
        let mut set = ImageSet::open_for_dump(dir.path(), 0, KindMask::bit(ChannelKind::RemapFpath)).unwrap();
        let img = set.get_mut(ChannelKind::RemapFpath).unwrap();
        img.file_mut().write_all(&100u32.to_ne_bytes()).unwrap();
        img.file_mut().write_all(&[0x08]).unwrap();
        set.close();

        let pipeline = Pipeline::new(RESTORE_STAGES).unwrap();
        let mut ctx = RestoreContext::new(&opts, 1);
        let err = pipeline.run(&mut ctx, &mut ops).unwrap_err();

        assert!(matches!(err, CrError::Stage { stage: StageId::CollectRemaps, .. }));
        assert!(matches!(err.root_cause(), CrError::Collect(_)));
        assert_eq!(ops.calls, vec!["check_inventory"]);
        assert_eq!(ctx.state.completed, vec![StageId::Inventory]);
        assert_eq!(ctx.state.failed, Some(StageId::CollectRemaps));
    }

    #[test]
    fn test_gc_stage_order() {
        let (_dir, opts, mut ops) = setup();

        let ctx = cr_garbage_collect(&opts, 1, &mut ops).unwrap();
        assert_eq!(ops.calls, vec!["prepare_mnt_ns", "collect_inet_sockets", "network_unlock"]);
        assert_eq!(ctx.state.completed.last(), Some(&StageId::DeleteRemaps));
    }

    #[test]
    fn test_remaps_retired_through_mntns() {
        use crate::criu::image::{ImageSet, KindMask};
        use crate::criu::image_desc::ChannelKind;
        use crate::criu::protobuf::pb_write_one;
        use crate::proto::{GhostFileEntry, RegFileEntry, RemapFilePathEntry, RemapType};

        let (dir, opts, mut ops) = setup();

        let mut set = ImageSet::open_for_dump(
            dir.path(),
            0,
            KindMask::of(&[ChannelKind::RegFiles, ChannelKind::RemapFpath]),
        )
        .unwrap();
        let rfe = RegFileEntry {
            id: 1,
            flags: 0,
            pos: 0,
            name: "/data".into(),
            mnt_id: None,
            size: None,
            mode: None,
        };
        pb_write_one(set.get_mut(ChannelKind::RegFiles).unwrap(), &rfe).unwrap();
        let rpe = RemapFilePathEntry { orig_id: 1, remap_id: 5, remap_type: Some(RemapType::Ghost as i32) };
        pb_write_one(set.get_mut(ChannelKind::RemapFpath).unwrap(), &rpe).unwrap();
        set.close();

        let mut ghost = ImageSet::open_for_dump(dir.path(), 5, KindMask::bit(ChannelKind::GhostFile)).unwrap();
        let gfe = GhostFileEntry { uid: 0, gid: 0, mode: libc::S_IFREG | 0o600, dev: None, ino: None, size: None };
        pb_write_one(ghost.get_mut(ChannelKind::GhostFile).unwrap(), &gfe).unwrap();
        ghost.close();

        let leftover = dir.path().join("data.cr.5.ghost");
        std::fs::write(&leftover, b"x").unwrap();

        let ctx = cr_restore_tasks(&opts, 1, &mut ops).unwrap();
        let report = ctx.retire_report.unwrap();
        assert_eq!(report.retired, 1);
        assert!(!leftover.exists());
    }

    static SWAPPED: &[StageSpec] = &[
        stage(StageId::Inventory, &[]),
        stage(StageId::PrepareMntNs, &[StageId::PreparePstree]),
        stage(StageId::PreparePstree, &[StageId::Inventory]),
    ];

    static TWICE: &[StageSpec] = &[stage(StageId::Inventory, &[]), stage(StageId::Inventory, &[])];

    static MISSING: &[StageSpec] = &[stage(StageId::DeleteRemaps, &[StageId::CollectRemaps])];

    #[test]
    fn test_layout_validation() {
        assert!(Pipeline::new(RESTORE_STAGES).is_ok());
        assert!(Pipeline::new(GC_STAGES).is_ok());
        assert!(matches!(Pipeline::new(SWAPPED), Err(CrError::PipelineOrder(_))));
        assert!(matches!(Pipeline::new(TWICE), Err(CrError::PipelineOrder(_))));
        assert!(matches!(Pipeline::new(MISSING), Err(CrError::PipelineOrder(_))));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(StageId::PrepareMntNs.to_string(), "prepare-mntns");
        assert_eq!(StageId::DeleteRemaps.to_string(), "delete-remaps");
    }
}
