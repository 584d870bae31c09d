pub mod classify;
pub mod context;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod harvest;
pub mod listing;
pub mod model;
pub mod pack;
pub mod pattern;
pub mod probe;
pub mod resolver;
pub mod since;
pub mod tables;
pub mod trim;

pub use context::{HarvestContext, ProgressSink, TracingProgress};
pub use error::{ErrorKind, HarvestError, Result};
pub use exec::{ExecOutput, ExecStatus, LocalShell, RemoteExecutor};
pub use harvest::{harvest_host, HostReport};
pub use model::{
    DownloadInstruction, FileFingerprint, HostPlacement, InstructionKind, NodeType, TargetPattern,
};
