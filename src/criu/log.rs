use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{CrError, Result};

// Start time for dmesg-style stamps
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Sets up the `log` backend. Lines look like `[    0.001234] INFO msg`.
/// `output` of `-` means stdout, any other path is truncated and written
/// to; without it logs go to stderr. `RUST_LOG` overrides the level.
pub fn log_init(output: Option<&Path>, verbose: bool) -> Result<()> {
    let start = *START_TIME.get_or_init(Instant::now);

    let log_level = if verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level));

    builder.format(move |buf, record| {
        let elapsed = start.elapsed();
        writeln!(
            buf,
            "[{:5}.{:06}] {} {}",
            elapsed.as_secs(),
            elapsed.subsec_micros(),
            record.level(),
            record.args()
        )
    });

    match output {
        Some(p) if p == Path::new("-") => {
            builder.target(env_logger::Target::Stdout);
        }
        Some(p) => {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .mode(0o600)
                .open(p)
                .map_err(|e| CrError::Options(format!("Can't create log file {}: {}", p.display(), e)))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(env_logger::Target::Stderr);
        }
    }

    builder
        .try_init()
        .map_err(|e| CrError::Options(format!("Log engine failure: {}", e)))
}
