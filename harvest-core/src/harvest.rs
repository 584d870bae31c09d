//! Per-host pipeline: probe, classify, fetch, trim, store.

use crate::classify::classify;
use crate::context::HarvestContext;
use crate::error::{ErrorKind, Result};
use crate::exec::RemoteExecutor;
use crate::fetch::RangeFetcher;
use crate::model::{DownloadInstruction, HostPlacement, InstructionKind, NodeType, TargetPattern};
use crate::pattern::matches_exactly;
use crate::probe::probe;
use crate::resolver::ResolvedTargets;
use crate::since::{SinceStore, Snapshot};
use crate::trim::trim;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Outcome of one host's pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostReport {
    pub host: String,
    /// Instructions fetched successfully.
    pub files: usize,
    /// Bytes kept after trimming.
    pub bytes: u64,
    pub deferred_bytes: u64,
    pub failed_transfers: usize,
    pub storage_errors: usize,
}

/// Run pre-collection commands; failures are logged and do not stop the pass.
///
/// Only a lost connection is returned.
fn run_commands(executor: &mut dyn RemoteExecutor, targets: &ResolvedTargets) -> Result<()> {
    for target in targets.iter() {
        let Some(command) = target.pattern.command.as_deref() else {
            continue;
        };
        info!(host = executor.host(), command, "Running pre-collection command");
        let output = match executor.run(command) {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::Connectivity => return Err(e),
            Err(e) => {
                error!(host = executor.host(), command, error = %e, "Pre-collection command failed");
                continue;
            }
        };
        if !output.success() {
            error!(
                host = executor.host(),
                command,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Pre-collection command failed"
            );
        }
    }
    Ok(())
}

/// Copy every file of the whole-copy targets, replacing earlier copies.
fn copy_whole(
    executor: &mut dyn RemoteExecutor,
    targets: &ResolvedTargets,
    fetcher: &RangeFetcher,
    report: &mut HostReport,
) -> Result<()> {
    let listed = probe(executor, &targets.sources())?;
    for (index, target) in targets.iter().enumerate() {
        for (path, fp) in listed.files.iter().filter(|(p, _)| matches_exactly(p, &target.source)) {
            let Some(destination) = targets.destination_for(index, path) else {
                continue;
            };
            if let Err(e) = fs::remove_file(&destination) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %destination.display(), error = %e, "Cannot replace copied file");
                    report.storage_errors += 1;
                    continue;
                }
            }
            let instruction = DownloadInstruction {
                source_path: path.clone(),
                destination_path: destination,
                offset_bytes: 0,
                length_bytes: 0,
                kind: InstructionKind::Fresh,
                target_index: index,
                baseline_path: None,
            };
            match fetcher.fetch(executor, &instruction, fp.size_bytes) {
                Ok(n) => {
                    set_readable(&instruction.destination_path);
                    report.files += 1;
                    report.bytes += n;
                }
                Err(e) if e.kind() == ErrorKind::Connectivity => return Err(e),
                Err(e) => {
                    warn!(host = executor.host(), source = %path, error = %e, "Copy failed");
                    if e.kind() == ErrorKind::Storage {
                        report.storage_errors += 1;
                    } else {
                        report.failed_transfers += 1;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o644)) {
        debug!(path = %path.display(), error = %e, "Cannot set copy permissions");
    }
}

#[cfg(not(unix))]
fn set_readable(_path: &Path) {}

/// Instructions grouped by destination, in first-appearance order.
fn group_by_destination(instructions: &[DownloadInstruction]) -> Vec<(PathBuf, Vec<&DownloadInstruction>)> {
    let mut groups: Vec<(PathBuf, Vec<&DownloadInstruction>)> = Vec::new();
    for instruction in instructions {
        match groups.iter_mut().find(|(dest, _)| *dest == instruction.destination_path) {
            Some((_, group)) => group.push(instruction),
            None => groups.push((instruction.destination_path.clone(), vec![instruction])),
        }
    }
    groups
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Put the destination back to its pre-pass length and forget the attempt.
fn roll_back(
    destination: &Path,
    start_len: u64,
    group: &[&DownloadInstruction],
    previous: &Snapshot,
    current: &mut Snapshot,
) {
    if destination.exists() {
        let truncated = OpenOptions::new()
            .write(true)
            .open(destination)
            .and_then(|f| f.set_len(start_len));
        if let Err(e) = truncated {
            error!(path = %destination.display(), error = %e, "Failed to roll back destination");
        }
    }
    let paths = group
        .iter()
        .flat_map(|i| std::iter::once(i.source_path.as_str()).chain(i.baseline_path.as_deref()));
    current.revert_paths(previous, paths);
}

/// Bytes a fetch is expected to move, for the wire compression decision.
fn expected_bytes(instruction: &DownloadInstruction, current: &Snapshot) -> u64 {
    if instruction.length_bytes > 0 {
        return instruction.length_bytes;
    }
    current
        .get(&instruction.source_path)
        .map(|fp| fp.size_bytes.saturating_sub(instruction.offset_bytes))
        .unwrap_or(0)
}

/// Harvest one host and persist its new baseline.
///
/// Connectivity failures before any transfer leave the stored snapshot
/// untouched and are returned to the caller. Transfer and storage failures
/// are contained to their destination.
pub fn harvest_host(
    ctx: &HarvestContext,
    executor: &mut dyn RemoteExecutor,
    node_type: NodeType,
    placement: &HostPlacement,
    patterns: &[TargetPattern],
) -> Result<HostReport> {
    let host = executor.host().to_string();
    let mut report = HostReport {
        host: host.clone(),
        ..HostReport::default()
    };
    info!(host = %host, node_type = %node_type, "Start collecting logs");

    let (copy_patterns, delta_patterns): (Vec<TargetPattern>, Vec<TargetPattern>) =
        patterns.iter().cloned().partition(|p| p.copy);
    let copies = ResolvedTargets::resolve(ctx, &host, node_type, placement, &copy_patterns);
    let targets = ResolvedTargets::resolve(ctx, &host, node_type, placement, &delta_patterns);
    if targets.is_empty() && copies.is_empty() {
        return Ok(report);
    }
    run_commands(executor, &copies)?;
    run_commands(executor, &targets)?;

    let fetcher = RangeFetcher::new(ctx.compress_threshold);
    if !targets.is_empty() {
        harvest_deltas(ctx, executor, &targets, &fetcher, &mut report)?;
    }
    if !copies.is_empty() {
        if let Err(e) = copy_whole(executor, &copies, &fetcher, &mut report) {
            warn!(host = %host, error = %e, "Whole-file copy abandoned");
        }
    }

    info!(
        host = %host,
        node_type = %node_type,
        files = report.files,
        bytes = report.bytes,
        "Finished collecting logs"
    );
    Ok(report)
}

/// Incremental collection of the tracked targets and snapshot update.
fn harvest_deltas(
    ctx: &HarvestContext,
    executor: &mut dyn RemoteExecutor,
    targets: &ResolvedTargets,
    fetcher: &RangeFetcher,
    report: &mut HostReport,
) -> Result<()> {
    let host = executor.host().to_string();
    let store = SinceStore::new(&ctx.state_dir);
    let _lock = store.lock(&ctx.profile, &host)?;
    let previous = store.load(&ctx.profile, &host)?;
    let mut current = probe(executor, &targets.sources())?;
    for path in current.resolve_mid_probe_renames() {
        debug!(host = %host, path = %path, "Renamed during probe; attributed to rotated sibling");
    }

    let instructions = classify(&previous, &current, targets);
    let mut host_lost = false;

    for (destination, group) in group_by_destination(&instructions) {
        let start_len = file_len(&destination);
        if host_lost {
            roll_back(&destination, start_len, &group, &previous, &mut current);
            continue;
        }

        let mut fetched = 0u64;
        let mut last: Option<(&DownloadInstruction, u64)> = None;
        let mut failed = false;
        for instruction in &group {
            let expected = expected_bytes(instruction, &current);
            match fetcher.fetch(executor, instruction, expected) {
                Ok(n) => {
                    fetched += n;
                    last = Some((*instruction, n));
                }
                Err(e) => {
                    match e.kind() {
                        ErrorKind::Storage => {
                            error!(host = %host, path = %destination.display(), error = %e, "Cannot write destination");
                            report.storage_errors += 1;
                        }
                        kind => {
                            warn!(host = %host, source = %instruction.source_path, error = %e, "Transfer failed");
                            report.failed_transfers += 1;
                            host_lost = kind == ErrorKind::Connectivity;
                        }
                    }
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            roll_back(&destination, start_len, &group, &previous, &mut current);
            continue;
        }

        let Some((last_instruction, last_fetched)) = last else {
            continue;
        };
        report.files += group.len();
        let pattern = targets
            .get(last_instruction.target_index)
            .map(|t| &t.pattern);
        let start = pattern.and_then(|p| p.record_start_pattern.as_deref());
        let end = pattern.map(|p| p.record_end_pattern.as_str()).unwrap_or("\n");

        let final_size = match trim(&destination, start, end) {
            Ok(outcome) => outcome.final_size,
            Err(e) => {
                error!(host = %host, path = %destination.display(), error = %e, "Cannot trim destination");
                report.storage_errors += 1;
                start_len + fetched
            }
        };
        let deferred = (start_len + fetched).saturating_sub(final_size);
        if deferred > 0 {
            info!(
                host = %host,
                source = %last_instruction.source_path,
                bytes = deferred,
                "Ignore {} bytes of incomplete log", deferred
            );
            if last_instruction.kind.targets_active() {
                current.shrink(&last_instruction.source_path, deferred.min(last_fetched));
            }
            report.deferred_bytes += deferred;
        }
        report.bytes += final_size.saturating_sub(start_len);
    }

    current.targets = targets.sources();
    store.store(&ctx.profile, &host, &current)
}
