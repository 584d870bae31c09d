//! Persisted per-(job, host) baseline.
//!
//! A stored snapshot is the listing of the last pass, the target sentinel,
//! then the literal target list that produced it. Keeping the targets next
//! to the data lets the next pass tell which targets are new.

use crate::error::{HarvestError, Result};
use crate::listing::{parse_listing, render_entry, split_targets, ListingEntry, TARGET_SENTINEL};
use crate::model::FileFingerprint;
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub files: BTreeMap<String, FileFingerprint>,
    pub targets: Vec<String>,
}

impl Snapshot {
    pub fn from_entries(entries: Vec<ListingEntry>, targets: Vec<String>) -> Self {
        Self {
            files: entries
                .into_iter()
                .map(|e| (e.path, e.fingerprint))
                .collect(),
            targets,
        }
    }

    pub fn parse(raw: &str) -> Self {
        let (listing, targets) = split_targets(raw);
        Self::from_entries(parse_listing(listing), targets)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (path, fingerprint) in &self.files {
            out.push_str(&render_entry(path, fingerprint));
            out.push('\n');
        }
        out.push_str(TARGET_SENTINEL);
        out.push('\n');
        for target in &self.targets {
            out.push_str(target);
            out.push('\n');
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.targets.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileFingerprint> {
        self.files.get(path)
    }

    /// inode -> path; the last path in order wins for shared inodes.
    pub fn inode_index(&self) -> HashMap<u64, &str> {
        self.files
            .iter()
            .map(|(path, fp)| (fp.inode, path.as_str()))
            .collect()
    }

    /// Record that `bytes` at the end of `path` were not kept.
    pub fn shrink(&mut self, path: &str, bytes: u64) {
        if let Some(fp) = self.files.get_mut(path) {
            fp.size_bytes = fp.size_bytes.saturating_sub(bytes);
        }
    }

    /// Restore `paths` to their state in `previous`, dropping unknown ones.
    pub fn revert_paths<'a>(&mut self, previous: &Snapshot, paths: impl IntoIterator<Item = &'a str>) {
        for path in paths {
            match previous.files.get(path) {
                Some(fp) => {
                    self.files.insert(path.to_string(), *fp);
                }
                None => {
                    self.files.remove(path);
                }
            }
        }
    }

    /// Attribute an inode listed under both an active path and one of its
    /// suffixed siblings to the sibling: the rename happened mid-probe.
    ///
    /// Returns the dropped active paths.
    pub fn resolve_mid_probe_renames(&mut self) -> Vec<String> {
        let mut by_inode: HashMap<u64, Vec<&str>> = HashMap::new();
        for (path, fp) in &self.files {
            by_inode.entry(fp.inode).or_default().push(path);
        }

        let mut dropped = Vec::new();
        for paths in by_inode.values().filter(|p| p.len() > 1) {
            for active in paths {
                let renamed = paths
                    .iter()
                    .any(|other| other.len() > active.len() && other.starts_with(active));
                if renamed {
                    dropped.push(active.to_string());
                }
            }
        }
        for path in &dropped {
            self.files.remove(path);
        }
        dropped.sort();
        dropped
    }
}

/// Directory of stored snapshots, one file per (profile, host).
#[derive(Debug, Clone)]
pub struct SinceStore {
    root: PathBuf,
}

/// Exclusive advisory lock on one (profile, host) pair; released on drop.
#[derive(Debug)]
pub struct SinceLock {
    file: File,
    path: PathBuf,
}

impl SinceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SinceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl SinceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn profile_dir(&self, profile: &str) -> PathBuf {
        let profile = if profile.is_empty() {
            DEFAULT_PROFILE
        } else {
            profile
        };
        self.root.join(sanitize(profile))
    }

    pub fn snapshot_path(&self, profile: &str, host: &str) -> PathBuf {
        self.profile_dir(profile)
            .join(format!("{}.sincedb", sanitize(host)))
    }

    /// Take the (profile, host) lock for a read-modify-write section.
    pub fn lock(&self, profile: &str, host: &str) -> Result<SinceLock> {
        let dir = self.profile_dir(profile);
        fs::create_dir_all(&dir).map_err(|e| HarvestError::storage(&dir, e))?;
        let path = dir.join(format!("{}.sincedb.lock", sanitize(host)));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HarvestError::storage(&path, e))?;
        file.lock_exclusive()
            .map_err(|e| HarvestError::storage(&path, e))?;
        Ok(SinceLock { file, path })
    }

    /// Previous snapshot, or an empty one on the first pass.
    pub fn load(&self, profile: &str, host: &str) -> Result<Snapshot> {
        let path = self.snapshot_path(profile, host);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Snapshot::parse(&raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(host, path = %path.display(), "No stored snapshot");
                Ok(Snapshot::default())
            }
            Err(e) => Err(HarvestError::storage(&path, e)),
        }
    }

    /// Replace the stored snapshot wholesale.
    pub fn store(&self, profile: &str, host: &str, snapshot: &Snapshot) -> Result<()> {
        let path = self.snapshot_path(profile, host);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| HarvestError::storage(dir, e))?;
        }
        let tmp = path.with_extension("sincedb.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(snapshot.render().as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| HarvestError::storage(&path, e))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(files: &[(&str, u64, u64)], targets: &[&str]) -> Snapshot {
        Snapshot {
            files: files
                .iter()
                .map(|(p, inode, size)| (p.to_string(), FileFingerprint::new(*inode, *size, 1_700_000_000)))
                .collect(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_store_and_load_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SinceStore::new(dir.path());
        let snap = snapshot(
            &[("/var/log/messages", 11, 300), ("/var/log/messages.1", 10, 900)],
            &["/var/log/messages"],
        );

        let _lock = store.lock("", "dom0a.example.com")?;
        store.store("", "dom0a.example.com", &snap)?;
        let loaded = store.load("", "dom0a.example.com")?;

        assert_eq!(loaded, snap);
        assert!(dir.path().join("default/dom0a.example.com.sincedb").exists());
        Ok(())
    }

    #[test]
    fn test_load_missing_is_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SinceStore::new(dir.path());
        assert!(store.load("fedramp", "cell01")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_profiles_are_separate() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SinceStore::new(dir.path());
        store.store("fedramp", "cell01", &snapshot(&[("/a", 1, 1)], &["/a"]))?;
        assert!(store.load("", "cell01")?.is_empty());
        assert!(!store.load("fedramp", "cell01")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_shrink_and_revert() {
        let previous = snapshot(&[("/var/log/x.log", 100, 50)], &[]);
        let mut current = snapshot(&[("/var/log/x.log", 200, 10), ("/var/log/x.log.1", 100, 50)], &[]);

        current.shrink("/var/log/x.log", 4);
        assert_eq!(current.get("/var/log/x.log").unwrap().size_bytes, 6);

        current.revert_paths(&previous, ["/var/log/x.log", "/var/log/x.log.1"]);
        assert_eq!(current.get("/var/log/x.log").unwrap().inode, 100);
        assert!(current.get("/var/log/x.log.1").is_none());
    }

    #[test]
    fn test_mid_probe_rename_prefers_sibling() {
        let mut current = snapshot(
            &[("/var/log/x.log", 100, 50), ("/var/log/x.log.1", 100, 55), ("/var/log/y.log", 7, 1)],
            &[],
        );
        let dropped = current.resolve_mid_probe_renames();
        assert_eq!(dropped, vec!["/var/log/x.log".to_string()]);
        assert!(current.get("/var/log/x.log").is_none());
        assert_eq!(current.get("/var/log/x.log.1").unwrap().size_bytes, 55);
        assert!(current.get("/var/log/y.log").is_some());
    }
}
