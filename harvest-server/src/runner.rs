//! One harvesting pass over the fleet.

use crate::config::Config;
use crate::ssh::SshExecutor;
use harvest_core::tables::{claim_marker, marker_interval, marker_path, HostInfo, HostTables};
use harvest_core::{
    harvest_host, pack, ErrorKind, HarvestContext, HostReport, LocalShell, NodeType, ProgressSink,
    RemoteExecutor, TargetPattern,
};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Default)]
pub struct PassOptions {
    pub job_id: String,
    /// Keys the persisted baselines and the management marker
    pub profile: String,
    /// Empty selects every node type
    pub node_types: Vec<NodeType>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    pub job_id: String,
    pub hosts_total: usize,
    pub hosts_collected: usize,
    pub hosts_skipped: usize,
    pub files: usize,
    pub bytes: u64,
    pub deferred_bytes: u64,
    pub failed_transfers: usize,
    pub storage_errors: usize,
    pub chunks: usize,
}

impl PassSummary {
    fn add(&mut self, report: &HostReport) {
        self.hosts_collected += 1;
        self.files += report.files;
        self.bytes += report.bytes;
        self.deferred_bytes += report.deferred_bytes;
        self.failed_transfers += report.failed_transfers;
        self.storage_errors += report.storage_errors;
    }
}

pub struct PassRunner {
    config: Arc<Config>,
    progress: Arc<dyn ProgressSink>,
}

impl PassRunner {
    pub fn new(config: Arc<Config>, progress: Arc<dyn ProgressSink>) -> Self {
        Self { config, progress }
    }

    pub async fn run(&self, opts: PassOptions) -> anyhow::Result<PassSummary> {
        let ctx = Arc::new(self.config.context(&opts.job_id, &opts.profile));
        std::fs::create_dir_all(&ctx.job_root)?;
        tracing::info!(job_id = %opts.job_id, profile = %opts.profile, "Starting harvesting pass");

        let groups: Vec<(NodeType, Vec<String>)> = NodeType::ALL
            .into_iter()
            .filter(|nt| opts.node_types.is_empty() || opts.node_types.contains(nt))
            .map(|nt| (nt, self.config.hosts_for(nt)))
            .collect();

        let mut summary = PassSummary {
            job_id: opts.job_id.clone(),
            hosts_total: groups.iter().map(|(_, hosts)| hosts.len()).sum(),
            ..PassSummary::default()
        };
        let total = summary.hosts_total.max(1);
        let completed = Arc::new(AtomicUsize::new(0));

        let mut tables = HostTables::new();
        tables.record_local(&local_names(&self.config));
        let tables = Arc::new(Mutex::new(tables));
        let semaphore = Arc::new(Semaphore::new(self.config.harvest.max_concurrent_hosts.max(1)));

        for (node_type, hosts) in groups {
            let Some(patterns) = self.config.targets_for(node_type) else {
                tracing::error!(node_type = %node_type, "No target table configured; skipping node type");
                completed.fetch_add(hosts.len(), Ordering::Relaxed);
                summary.hosts_skipped += hosts.len();
                continue;
            };

            if node_type == NodeType::Management && !self.claim_management(&ctx).await {
                completed.fetch_add(hosts.len(), Ordering::Relaxed);
                summary.hosts_skipped += hosts.len();
                continue;
            }

            let patterns: Arc<Vec<TargetPattern>> = Arc::new(patterns.to_vec());
            let mut set = JoinSet::new();

            for host in hosts {
                let permit = semaphore.clone().acquire_owned().await?;
                let percent = (100 * completed.load(Ordering::Relaxed) / total) as u8;
                self.progress
                    .report(percent, &format!("Collecting system logs from {host}"));

                let config = self.config.clone();
                let ctx = ctx.clone();
                let patterns = patterns.clone();
                let tables = tables.clone();
                set.spawn_blocking(move || {
                    let _permit = permit;
                    let result = collect_host(&config, &ctx, node_type, &host, &patterns, &tables);
                    (host, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                completed.fetch_add(1, Ordering::Relaxed);
                match joined {
                    Ok((_, Ok(report))) => summary.add(&report),
                    Ok((host, Err(e))) if e.kind() == ErrorKind::Connectivity => {
                        tracing::warn!(host = %host, error = %e, "Skip system log collection on host");
                        summary.hosts_skipped += 1;
                    }
                    Ok((host, Err(e))) => {
                        tracing::error!(host = %host, error = %e, "Log collection failed");
                        summary.hosts_skipped += 1;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Host task panicked");
                        summary.hosts_skipped += 1;
                    }
                }
            }
        }

        let flush = {
            let ctx = ctx.clone();
            let tables = tables.clone();
            tokio::task::spawn_blocking(move || {
                let snapshot = match tables.lock() {
                    Ok(tables) => tables.clone(),
                    Err(_) => return Ok(()),
                };
                snapshot.flush(&ctx.config_dir)
            })
        };
        if let Err(e) = flush.await? {
            tracing::error!(error = %e, "Failed to update host tables");
        }

        let pack_ctx = ctx.clone();
        summary.chunks = tokio::task::spawn_blocking(move || {
            let chunks = pack::pack(&pack_ctx.results_root, &pack_ctx.job_id, pack_ctx.chunk_size)
                .unwrap_or_else(|e| {
                    tracing::error!(job_id = %pack_ctx.job_id, error = %e, "Failed to pack collection");
                    0
                });
            let removed = pack::cleanup(&pack_ctx.cleanup_roots(), pack_ctx.retention);
            if removed > 0 {
                tracing::info!(removed, "Removed expired collection artifacts");
            }
            chunks
        })
        .await?;

        self.progress
            .report(100, &format!("Done with {} chunks", summary.chunks));
        tracing::info!(
            job_id = %summary.job_id,
            hosts = summary.hosts_collected,
            skipped = summary.hosts_skipped,
            bytes = summary.bytes,
            chunks = summary.chunks,
            "Harvesting pass finished"
        );
        Ok(summary)
    }

    /// False when the marker is fresh or cannot be read.
    async fn claim_management(&self, ctx: &HarvestContext) -> bool {
        let path = marker_path(&ctx.config_dir, &ctx.profile);
        let interval = marker_interval(&ctx.profile);
        let now = chrono::Local::now().timestamp_millis() as f64 / 1000.0;
        let claimed = tokio::task::spawn_blocking({
            let path = path.clone();
            move || claim_marker(&path, interval, now)
        })
        .await;
        match claimed {
            Ok(Ok(claimed)) => claimed,
            Ok(Err(e)) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot update collection marker; skipping management host");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Collection marker task failed");
                false
            }
        }
    }
}

/// Delete expired artifacts without collecting.
pub fn run_cleanup(config: &Config) -> usize {
    let ctx = config.context("cleanup", "");
    pack::cleanup(&ctx.cleanup_roots(), ctx.retention)
}

fn local_names(config: &Config) -> Vec<String> {
    let mut names = vec![config.management_host()];
    if let Some(name) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn collect_host(
    config: &Config,
    ctx: &HarvestContext,
    node_type: NodeType,
    host: &str,
    patterns: &[TargetPattern],
    tables: &Mutex<HostTables>,
) -> harvest_core::Result<HostReport> {
    let placement = config.placement_for(host);
    let mut executor: Box<dyn RemoteExecutor> = if node_type.is_local() {
        Box::new(LocalShell::new(host).with_sudo(config.harvest.management_sudo))
    } else {
        let executor = SshExecutor::connect(host, &config.ssh, config.connect_timeout())?;
        Box::new(executor)
    };

    if !node_type.is_local() {
        let info = HostInfo::query(executor.as_mut());
        if let Ok(mut tables) = tables.lock() {
            tables.record(host, &info);
        }
    }

    harvest_host(ctx, executor.as_mut(), node_type, &placement, patterns)
}
