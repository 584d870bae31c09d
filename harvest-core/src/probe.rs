//! One listing of a host covering every target and its rotated siblings.

use crate::error::{HarvestError, Result};
use crate::exec::RemoteExecutor;
use crate::listing::{listing_command, parse_listing};
use crate::since::Snapshot;
use tracing::debug;

/// Probe `sources` on the executor's host.
///
/// `ls` exits non-zero when some operand has no match; that is normal and
/// the output is still parsed. Only a failure to run the command is an
/// error, so the caller can skip the host without touching its baseline.
pub fn probe(executor: &mut dyn RemoteExecutor, sources: &[String]) -> Result<Snapshot> {
    if sources.is_empty() {
        return Ok(Snapshot::default());
    }
    let host = executor.host().to_string();
    let output = executor
        .run(&listing_command(sources))
        .map_err(|e| match e {
            HarvestError::Connectivity { .. } => e,
            other => HarvestError::connectivity(&host, other),
        })?;

    if !output.success() && !output.stderr.trim().is_empty() {
        debug!(host = %host, exit_code = output.exit_code, stderr = %output.stderr.trim(), "Listing reported missing files");
    }

    let entries = parse_listing(&output.stdout_lossy());
    debug!(host = %host, files = entries.len(), "Probed");
    Ok(Snapshot::from_entries(entries, sources.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ExecStatus, LocalShell};
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    struct Unreachable;

    impl RemoteExecutor for Unreachable {
        fn host(&self) -> &str {
            "cel09"
        }

        fn is_local(&self) -> bool {
            false
        }

        fn run_streaming(&mut self, _command: &str, _sink: &mut dyn Write) -> Result<ExecStatus> {
            Err(HarvestError::connectivity("cel09", "connection timed out"))
        }
    }

    #[test]
    fn test_unreachable_host_is_connectivity_error() {
        let err = probe(&mut Unreachable, &["/var/log/messages".to_string()]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connectivity);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_probe_local_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let log = dir.path().join("app.log");
        fs::write(&log, "hello\n")?;
        fs::write(dir.path().join("app.log.1"), "older\nlines\n")?;
        fs::create_dir(dir.path().join("app.log.d"))?;

        let active = log.to_string_lossy().into_owned();
        let missing = dir.path().join("nothing.log").to_string_lossy().into_owned();
        let snapshot = probe(&mut LocalShell::new("localhost"), &[active.clone(), missing.clone()])?;

        assert_eq!(snapshot.targets, vec![active.clone(), missing]);
        assert_eq!(snapshot.get(&active).map(|fp| fp.size_bytes), Some(6));
        assert_eq!(snapshot.get(&format!("{active}.1")).map(|fp| fp.size_bytes), Some(12));
        assert_eq!(snapshot.files.len(), 2);
        Ok(())
    }
}
