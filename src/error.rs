use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::criu::cr_restore::StageId;

#[derive(Error, Debug)]
pub enum CrError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("Can't create image {}: {source}", path.display())]
    ChannelCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Can't open image {}: {source}", path.display())]
    ChannelOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Magic doesn't match for {}: expected {expected:#010x}, found {found:#010x}", path.display())]
    MagicMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("Invalid image format: {reason}")]
    InvalidImage { reason: String },

    #[error("Inventory check failed: {0}")]
    Inventory(String),

    #[error("Collecting remaps failed: {0}")]
    Collect(String),

    #[error("Process tree error: {0}")]
    Pstree(String),

    #[error("Mount namespace error: {0}")]
    Mount(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Restore memory error: {0}")]
    RstMem(String),

    #[error("Network lock error: {0}")]
    Netfilter(String),

    #[error("Invalid options: {0}")]
    Options(String),

    #[error("Bad pipeline layout: {0}")]
    PipelineOrder(String),

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: StageId,
        #[source]
        source: Box<CrError>,
    },
}

impl CrError {
    /// The innermost error, unwrapping stage context.
    pub fn root_cause(&self) -> &CrError {
        match self {
            CrError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// A per-item failure that is logged and skipped instead of aborting.
///
/// Kept apart from [`CrError`]; collected into a report by the caller.
#[derive(Error, Debug)]
#[error("Couldn't remove {}: {source}", path.display())]
pub struct RetireFailure {
    pub orig_id: u32,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

pub type Result<T> = std::result::Result<T, CrError>;
