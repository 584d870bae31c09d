//! Chunked archives of a collection tree, and age-based cleanup.

use crate::error::{HarvestError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

pub fn chunk_name(job_id: &str, index: usize) -> String {
    format!("{job_id}.tar.gz.{index:02}")
}

/// Archive `<results_root>/<job_id>` into `<job_id>.tar.gz.NN` chunks.
///
/// The collection tree and the unsplit archive are removed. A missing or
/// file-less tree yields zero chunks.
pub fn pack(results_root: &Path, job_id: &str, chunk_size: u64) -> Result<usize> {
    if chunk_size == 0 {
        return Err(HarvestError::Config("tar chunk size must be positive".into()));
    }
    let job_root = results_root.join(job_id);
    if !job_root.is_dir() {
        return Ok(0);
    }

    let has_files = WalkDir::new(&job_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file());
    if !has_files {
        tracing::info!(job_id, "Nothing collected");
        fs::remove_dir_all(&job_root).map_err(|e| HarvestError::storage(&job_root, e))?;
        return Ok(0);
    }

    let archive = results_root.join(format!("{job_id}.tar.gz"));
    write_archive(&archive, &job_root, job_id).map_err(|e| HarvestError::storage(&archive, e))?;
    fs::remove_dir_all(&job_root).map_err(|e| HarvestError::storage(&job_root, e))?;

    let chunks = split(&archive, results_root, job_id, chunk_size)
        .map_err(|e| HarvestError::storage(&archive, e))?;
    fs::remove_file(&archive).map_err(|e| HarvestError::storage(&archive, e))?;

    tracing::info!(job_id, chunks, "Packed collection");
    Ok(chunks)
}

fn write_archive(archive: &Path, job_root: &Path, job_id: &str) -> io::Result<()> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(job_id, job_root)?;
    builder.into_inner()?.finish()?.sync_all()
}

fn split(archive: &Path, dir: &Path, job_id: &str, chunk_size: u64) -> io::Result<usize> {
    let total = fs::metadata(archive)?.len();
    let count = total.div_ceil(chunk_size) as usize;
    let mut input = File::open(archive)?;
    for index in 0..count {
        let mut chunk = File::create(dir.join(chunk_name(job_id, index)))?;
        io::copy(&mut (&mut input).take(chunk_size), &mut chunk)?;
    }
    Ok(count)
}

/// Delete top-level entries of `roots` whose mtime is older than `retention`.
///
/// Returns the number of entries removed. Failures are logged and skipped.
pub fn cleanup(roots: &[PathBuf], retention: Duration) -> usize {
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return 0;
    };
    let mut removed = 0;

    for root in roots {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Cannot read cleanup root");
                continue;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let expired = metadata.modified().map(|m| m < cutoff).unwrap_or(false);
            if !expired {
                continue;
            }
            let result = if metadata.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Removed expired artifact");
                    removed += 1;
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove expired artifact"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    #[test]
    fn test_pack_empty_root_yields_no_chunks() -> Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(pack(dir.path(), "job-1", 1024)?, 0);

        fs::create_dir_all(dir.path().join("job-1/rack_messages/trunk"))?;
        assert_eq!(pack(dir.path(), "job-1", 1024)?, 0);
        assert!(!dir.path().join("job-1").exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_pack_splits_into_numbered_chunks() -> Result<()> {
        let dir = TempDir::new()?;
        let host_dir = dir.path().join("job-2/rack_messages/trunk/trunk/dom0a");
        fs::create_dir_all(&host_dir)?;
        // xorshift noise so the archive stays larger than one chunk
        let mut state = 0x2545_f491_u32;
        let payload: Vec<u8> = (0..80_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        fs::write(host_dir.join("messages"), &payload)?;

        let chunks = pack(dir.path(), "job-2", 4 * 1024)?;
        assert!(chunks > 1);
        assert!(!dir.path().join("job-2").exists());
        assert!(!dir.path().join("job-2.tar.gz").exists());

        let mut joined = Vec::new();
        for index in 0..chunks {
            let chunk = dir.path().join(chunk_name("job-2", index));
            assert!(chunk.exists(), "{}", chunk.display());
            joined.extend(fs::read(chunk)?);
        }
        assert!(!dir.path().join(chunk_name("job-2", chunks)).exists());

        let mut archive = tar::Archive::new(GzDecoder::new(joined.as_slice()));
        let mut found = false;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.ends_with("job-2/rack_messages/trunk/trunk/dom0a/messages") {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                assert_eq!(content, payload);
                found = true;
            }
        }
        assert!(found);
        Ok(())
    }

    #[test]
    fn test_chunk_name_is_two_digits() {
        assert_eq!(chunk_name("abc", 0), "abc.tar.gz.00");
        assert_eq!(chunk_name("abc", 12), "abc.tar.gz.12");
    }

    #[test]
    fn test_cleanup_removes_only_expired() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let old_file = dir.path().join("old.tar.gz.00");
        let old_dir = dir.path().join("old-job");
        let fresh = dir.path().join("fresh.tar.gz.00");
        fs::write(&old_file, "x")?;
        fs::create_dir_all(old_dir.join("nested"))?;
        fs::write(&fresh, "y")?;

        let two_days_ago = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(48 * 3600));
        filetime::set_file_mtime(&old_file, two_days_ago)?;
        filetime::set_file_mtime(&old_dir, two_days_ago)?;

        let removed = cleanup(
            &[dir.path().to_path_buf(), dir.path().join("missing")],
            Duration::from_secs(24 * 3600),
        );
        assert_eq!(removed, 2);
        assert!(!old_file.exists());
        assert!(!old_dir.exists());
        assert!(fresh.exists());
        Ok(())
    }
}
