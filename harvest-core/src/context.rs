//! Per-job state passed explicitly to every stage.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_COMPRESS_THRESHOLD: u64 = 65535;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct HarvestContext {
    /// Names this run's artifacts.
    pub job_id: String,
    /// Stable key under which snapshots persist across runs.
    pub profile: String,
    /// `<root>/diagnostic/results`; chunks land here.
    pub results_root: PathBuf,
    /// `<results_root>/<job_id>`; the collection tree of this run.
    pub job_root: PathBuf,
    /// `<root>/diagnostic/config`; shared host tables and markers.
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub forward_repo: Option<PathBuf>,
    pub forward_categories: Vec<String>,
    pub compress_threshold: u64,
    pub chunk_size: u64,
    pub retention: Duration,
    pub started_at: DateTime<Local>,
}

impl HarvestContext {
    pub fn new(job_id: impl Into<String>, root_dir: impl AsRef<Path>, state_dir: impl Into<PathBuf>) -> Self {
        let job_id = job_id.into();
        let diag = root_dir.as_ref().join("diagnostic");
        let results_root = diag.join("results");
        Self {
            job_root: results_root.join(&job_id),
            results_root,
            config_dir: diag.join("config"),
            state_dir: state_dir.into(),
            job_id,
            profile: String::new(),
            forward_repo: None,
            forward_categories: Vec::new(),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retention: DEFAULT_RETENTION,
            started_at: Local::now(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_forward_repo(mut self, repo: impl Into<PathBuf>, categories: Vec<String>) -> Self {
        self.forward_repo = Some(repo.into());
        self.forward_categories = categories;
        self
    }

    /// Directories subject to age-based cleanup.
    pub fn cleanup_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.results_root.clone()];
        if let Some(repo) = &self.forward_repo {
            roots.push(repo.clone());
        }
        roots
    }
}

/// Receives pass progress, once per host and once at the end.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, status: &str);
}

/// Default sink: progress goes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, percent: u8, status: &str) {
        tracing::info!(percent, status, "Progress");
    }
}
