//! Configuration for harvesting passes.
//!
//! Loads a TOML file with serde defaults, then applies environment
//! overrides (a `.env` file is honoured).

use harvest_core::{HarvestContext, HostPlacement, NodeType, TargetPattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub harvest: HarvestConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Placement used for hosts without one in `inventory.placement`
    #[serde(default)]
    pub rack: HostPlacement,

    #[serde(default)]
    pub inventory: Inventory,

    /// Node type name (or alias) -> ordered targets
    #[serde(default)]
    pub targets: BTreeMap<String, Vec<TargetPattern>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Diagnostics root; results live under `<root>/diagnostic/results`
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Snapshot store
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_tar_chunk_size")]
    pub tar_chunk_size: u64,

    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Remote transfers above this many bytes are gzip-compressed on the wire
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: u64,

    /// 1 keeps the pass sequential
    #[serde(default = "default_max_concurrent_hosts")]
    pub max_concurrent_hosts: usize,

    /// Run management host commands through sudo
    #[serde(default)]
    pub management_sudo: bool,

    /// Six-field cron expression for `serve`
    #[serde(default = "default_schedule")]
    pub schedule: String,

    #[serde(default)]
    pub forward_repo: Option<PathBuf>,

    #[serde(default)]
    pub forward_categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key; the ssh-agent is used when absent
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Hosts per node type. Fleet discovery happens elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub compute: Vec<String>,
    #[serde(default)]
    pub guest: Vec<String>,
    #[serde(default)]
    pub storage: Vec<String>,
    #[serde(default)]
    pub switch: Vec<String>,

    /// Name of the management host; defaults to this machine's hostname
    #[serde(default)]
    pub management: Option<String>,

    #[serde(default)]
    pub placement: BTreeMap<String, HostPlacement>,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/var/lib/log-harvest")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/cache/log-harvest")
}

fn default_tar_chunk_size() -> u64 {
    harvest_core::context::DEFAULT_CHUNK_SIZE
}

fn default_retention_hours() -> u64 {
    24
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_compress_threshold() -> u64 {
    harvest_core::context::DEFAULT_COMPRESS_THRESHOLD
}

fn default_max_concurrent_hosts() -> usize {
    1
}

fn default_schedule() -> String {
    "0 */20 * * * *".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            state_dir: default_state_dir(),
            tar_chunk_size: default_tar_chunk_size(),
            retention_hours: default_retention_hours(),
            connect_timeout_secs: default_connect_timeout_secs(),
            compress_threshold: default_compress_threshold(),
            max_concurrent_hosts: default_max_concurrent_hosts(),
            management_sudo: false,
            schedule: default_schedule(),
            forward_repo: None,
            forward_categories: Vec::new(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// File (or defaults) plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("HARVEST_ROOT_DIR") {
            self.harvest.root_dir = PathBuf::from(v);
        }
        if let Some(v) = var("HARVEST_STATE_DIR") {
            self.harvest.state_dir = PathBuf::from(v);
        }
        if let Some(v) = var("HARVEST_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = var("HARVEST_MAX_CONCURRENT_HOSTS") {
            self.harvest.max_concurrent_hosts = v
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Env {
                    key: "HARVEST_MAX_CONCURRENT_HOSTS",
                    value: v,
                })?;
        }
        if let Some(v) = var("HARVEST_SSH_USER") {
            self.ssh.user = v;
        }
        Ok(())
    }

    /// Targets for a node type; `None` when the table is missing.
    pub fn targets_for(&self, node_type: NodeType) -> Option<&[TargetPattern]> {
        self.targets
            .iter()
            .find(|(key, _)| key.parse::<NodeType>().ok() == Some(node_type))
            .map(|(_, patterns)| patterns.as_slice())
    }

    pub fn hosts_for(&self, node_type: NodeType) -> Vec<String> {
        match node_type {
            NodeType::Compute => self.inventory.compute.clone(),
            NodeType::Guest => self.inventory.guest.clone(),
            NodeType::Storage => self.inventory.storage.clone(),
            NodeType::Switch => self.inventory.switch.clone(),
            NodeType::Management => vec![self.management_host()],
        }
    }

    pub fn management_host(&self) -> String {
        self.inventory.management.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }

    pub fn placement_for(&self, host: &str) -> HostPlacement {
        self.inventory
            .placement
            .get(host)
            .cloned()
            .unwrap_or_else(|| self.rack.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.harvest.connect_timeout_secs)
    }

    /// Per-run context for `job_id`; `profile` keys the persisted baselines.
    pub fn context(&self, job_id: &str, profile: &str) -> HarvestContext {
        let mut ctx = HarvestContext::new(job_id, &self.harvest.root_dir, self.harvest.state_dir.clone())
            .with_profile(profile);
        if let Some(repo) = &self.harvest.forward_repo {
            ctx = ctx.with_forward_repo(repo.clone(), self.harvest.forward_categories.clone());
        }
        ctx.compress_threshold = self.harvest.compress_threshold;
        ctx.chunk_size = self.harvest.tar_chunk_size;
        ctx.retention = Duration::from_secs(self.harvest.retention_hours * 3600);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[harvest]
root_dir = "/srv/harvest"
max_concurrent_hosts = 4
forward_repo = "/srv/forward"
forward_categories = ["rack_dcs-agent"]

[ssh]
user = "opc"

[rack]
cabinet = "cab1"
rack = "r7"
cluster = "clu1"

[inventory]
compute = ["dom0a.example.com", "dom0b.example.com"]

[inventory.placement."dom0b.example.com"]
cabinet = "cab2"
rack = "r1"

[[targets.dom0]]
source = "/var/log/messages"
category = "rack_messages"
filename = "messages"

[[targets.dom0]]
source = "/var/log/cellos/validations.log"
category = "rack_validations"
filename = "validations.log"
end_of_msg = "\n"

[[targets.cell]]
source = "/opt/oracle/cell/log/diag/asm/cell/<hostname>/trace/alert.log"
category = "rack_alert"
filename = "alert.log"
start_of_msg = "20"
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.harvest.max_concurrent_hosts, 4);
        assert_eq!(config.harvest.tar_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.harvest.connect_timeout_secs, 20);
        assert_eq!(config.ssh.user, "opc");
        assert_eq!(config.ssh.port, 22);

        let compute = config.targets_for(NodeType::Compute).unwrap();
        assert_eq!(compute.len(), 2);
        assert_eq!(compute[0].source_glob, "/var/log/messages");
        let storage = config.targets_for(NodeType::Storage).unwrap();
        assert_eq!(storage[0].record_start_pattern.as_deref(), Some("20"));
        assert!(config.targets_for(NodeType::Switch).is_none());

        assert_eq!(config.placement_for("dom0a.example.com").rack, "r7");
        let b = config.placement_for("dom0b.example.com");
        assert_eq!((b.cabinet.as_str(), b.rack.as_str(), b.cluster.as_str()), ("cab2", "r1", ""));
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.rack.cabinet, "trunk");
        assert!(config.hosts_for(NodeType::Guest).is_empty());
        assert_eq!(config.hosts_for(NodeType::Management).len(), 1);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HARVEST_ROOT_DIR", "/data/harvest"),
            ("HARVEST_MAX_CONCURRENT_HOSTS", "8"),
            ("HARVEST_SSH_USER", "harvest"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.harvest.root_dir, PathBuf::from("/data/harvest"));
        assert_eq!(config.harvest.max_concurrent_hosts, 8);
        assert_eq!(config.ssh.user, "harvest");

        let err = Config::default()
            .apply_env(|key| (key == "HARVEST_MAX_CONCURRENT_HOSTS").then(|| "zero".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("HARVEST_MAX_CONCURRENT_HOSTS"));
    }

    #[test]
    fn test_context_from_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let ctx = config.context("job-9", "fedramp");
        assert_eq!(ctx.job_root, PathBuf::from("/srv/harvest/diagnostic/results/job-9"));
        assert_eq!(ctx.profile, "fedramp");
        assert_eq!(ctx.forward_repo, Some(PathBuf::from("/srv/forward")));
        assert_eq!(ctx.retention, Duration::from_secs(24 * 3600));
    }
}
