use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crprep::criu::cr_restore::{cr_garbage_collect, cr_restore_tasks, HostRestoreOps};
use crprep::criu::crtools::{cr_dump_tasks, cr_show};
use crprep::criu::log::log_init;
use crprep::criu::options::{parse_ns_string, CrOptions, NetworkLockMethod, TaskFinalState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Dump,
    Restore,
    Show,
    Gc,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LockMethod {
    Iptables,
    Nftables,
    Skip,
}

impl From<LockMethod> for NetworkLockMethod {
    fn from(m: LockMethod) -> Self {
        match m {
            LockMethod::Iptables => NetworkLockMethod::Iptables,
            LockMethod::Nftables => NetworkLockMethod::Nftables,
            LockMethod::Skip => NetworkLockMethod::Skip,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "crprep")]
#[command(about = "checkpoint images and restore preparation", long_about = None)]
struct Args {
    #[arg(value_enum)]
    mode: Mode,

    /// Checkpoint/restore only this process, not its children
    #[arg(short = 'p', value_name = "PID", conflicts_with = "tree")]
    pid: Option<u32>,

    /// Checkpoint/restore the whole process tree rooted at PID
    #[arg(short = 't', value_name = "PID")]
    tree: Option<u32>,

    /// Namespaces to checkpoint/restore, e.g. uts,ipc
    #[arg(short = 'n', value_name = "NS")]
    namespaces: Option<String>,

    /// Directory for image files
    #[arg(short = 'D', long = "images-dir", value_name = "DIR", default_value = ".")]
    images_dir: PathBuf,

    /// Log to FILE, `-` for stdout
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Show page contents (show), leave tasks running (dump)
    #[arg(short = 'c')]
    contents: bool,

    /// Image file to show; without it show prints the images of -p/-t PID
    #[arg(short = 'f', value_name = "FILE")]
    file: Option<PathBuf>,

    /// Detach after restore
    #[arg(short = 'd')]
    detach: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Root the restored mount namespace is anchored at
    #[arg(long, value_name = "DIR", default_value = "/")]
    root: PathBuf,

    /// Don't restore established TCP connections
    #[arg(long)]
    tcp_close: bool,

    #[arg(long, value_enum, default_value = "iptables")]
    network_lock: LockMethod,

    /// Print per-stage timings when done
    #[arg(long)]
    display_stats: bool,
}

fn build_opts(args: &Args) -> anyhow::Result<CrOptions> {
    let mut opts = CrOptions {
        leader_only: args.pid.is_some(),
        show_dump_file: args.file.clone(),
        restore_detach: args.detach,
        imgs_dir: args.images_dir.clone(),
        root: args.root.clone(),
        output: args.output.clone(),
        network_lock_method: args.network_lock.into(),
        tcp_close: args.tcp_close,
        display_stats: args.display_stats,
        ..Default::default()
    };

    if args.contents {
        match args.mode {
            Mode::Show => opts.show_pages_content = true,
            _ => opts.final_state = TaskFinalState::Run,
        }
    }

    if let Some(ns) = &args.namespaces {
        opts.namespaces_flags = parse_ns_string(ns)?;
    }

    Ok(opts)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    log_init(args.output.as_deref(), args.verbose)?;

    let opts = build_opts(&args)?;
    let need_pid = || match args.pid.or(args.tree) {
        Some(pid) => Ok(pid),
        None => Err(anyhow::anyhow!("{:?} needs a pid (-p or -t)", args.mode)),
    };

    match args.mode {
        Mode::Show => cr_show(&opts, args.pid.or(args.tree)).context("show failed")?,
        Mode::Dump => cr_dump_tasks(&opts, need_pid()?).context("dump failed")?,
        Mode::Restore => {
            let pid = need_pid()?;
            cr_restore_tasks(&opts, pid, &mut HostRestoreOps).context("restore failed")?;
            if opts.restore_detach {
                log::info!("Restore of {} prepared, detaching", pid);
            }
        }
        Mode::Gc => {
            let ctx = cr_garbage_collect(&opts, need_pid()?, &mut HostRestoreOps).context("gc failed")?;
            if let Some(report) = ctx.retire_report.filter(|r| !r.is_clean()) {
                for f in &report.failures {
                    log::warn!("{}", f);
                }
            }
        }
    }

    Ok(())
}
