//! Change classification between two probes of one host.
//!
//! Two point-in-time samples of `{path, inode, size}` are all there is, so the
//! rotation discipline that fired has to be inferred. Inode equality means
//! "same bytes"; the size trajectory separates growth, copy-truncate and
//! rename-create.
//!
//! Candidates of each target are visited oldest data first, and the first
//! emitted instruction of a target clears its "oldest" flag. Only the oldest
//! rotated copy may carry bytes written before the active file was truncated
//! or renamed; younger ones were collected on earlier passes.

use crate::model::{DownloadInstruction, FileFingerprint, InstructionKind};
use crate::pattern::{
    is_compressed, matches_by_prefix, matches_exactly, original_path, sort_rotated, suffix_position,
};
use crate::resolver::ResolvedTargets;
use crate::since::Snapshot;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Byte range decided for one candidate, before destination routing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Decision {
    source_path: String,
    /// Active path whose destination receives the bytes.
    key_path: String,
    offset_bytes: u64,
    length_bytes: u64,
    kind: InstructionKind,
    baseline_path: Option<String>,
}

impl Decision {
    fn new(source: &str, key: &str, offset: u64, length: u64, kind: InstructionKind, baseline: Option<&str>) -> Self {
        Self {
            source_path: source.to_string(),
            key_path: key.to_string(),
            offset_bytes: offset,
            length_bytes: length,
            kind,
            baseline_path: baseline.map(str::to_string),
        }
    }
}

/// Compute the ordered download instructions for one host.
///
/// Pure: identical snapshots yield no instructions.
pub fn classify(previous: &Snapshot, current: &Snapshot, targets: &ResolvedTargets) -> Vec<DownloadInstruction> {
    let sources = targets.sources();
    let candidates = candidates(previous, current, &sources);
    let classifier = Classifier {
        previous,
        current,
        candidates: &candidates,
        last_inodes: previous.inode_index(),
    };

    let mut instructions = Vec::new();
    for (index, source) in sources.iter().enumerate() {
        let matched: Vec<String> = candidates
            .keys()
            .filter(|path| matches_by_prefix(path, source))
            .cloned()
            .collect();

        let mut oldest = true;
        for path in sort_rotated(matched, source) {
            let Some(decision) = classifier.decide(&path, source, oldest) else {
                continue;
            };
            oldest = false;

            match targets.destination_for(index, &decision.key_path) {
                Some(destination_path) => {
                    debug!(
                        source = %decision.source_path,
                        destination = %destination_path.display(),
                        offset = decision.offset_bytes,
                        length = decision.length_bytes,
                        kind = ?decision.kind,
                        "Download"
                    );
                    instructions.push(DownloadInstruction {
                        source_path: decision.source_path,
                        destination_path,
                        offset_bytes: decision.offset_bytes,
                        length_bytes: decision.length_bytes,
                        kind: decision.kind,
                        target_index: index,
                        baseline_path: decision.baseline_path,
                    });
                }
                None => debug!(
                    source = %decision.source_path,
                    key = %decision.key_path,
                    "Ignore unroutable path"
                ),
            }
        }
    }
    instructions
}

/// Current files worth classifying.
///
/// Drops files unchanged since the previous probe, and files owned by a
/// target absent from the previous target list. A file is owned by the
/// target naming the longest stem of its path, so a new
/// `/var/log/messages_debug` owns its files even though the known
/// `/var/log/messages` also matches them by prefix.
fn candidates(previous: &Snapshot, current: &Snapshot, sources: &[String]) -> BTreeMap<String, FileFingerprint> {
    let (known, added): (Vec<&String>, Vec<&String>) =
        sources.iter().partition(|s| previous.targets.contains(s));

    current
        .files
        .iter()
        .filter(|(path, fp)| {
            if let Some(last) = previous.get(path) {
                if last.inode == fp.inode && last.size_bytes == fp.size_bytes {
                    return false;
                }
            }
            let newly_added = stem_len(path, &added) > stem_len(path, &known);
            if newly_added {
                debug!(path = %path, "Ignore existing data of newly added target");
            }
            !newly_added
        })
        .map(|(path, fp)| (path.clone(), *fp))
        .collect()
}

/// Longest stem of `path` named by any of `sources`.
fn stem_len(path: &str, sources: &[&String]) -> Option<usize> {
    sources
        .iter()
        .filter(|s| matches_by_prefix(path, s))
        .map(|s| {
            if matches_exactly(path, s) {
                path.len()
            } else {
                suffix_position(path, s)
            }
        })
        .max()
}

struct Classifier<'a> {
    previous: &'a Snapshot,
    current: &'a Snapshot,
    candidates: &'a BTreeMap<String, FileFingerprint>,
    last_inodes: HashMap<u64, &'a str>,
}

impl Classifier<'_> {
    fn decide(&self, path: &str, pattern: &str, oldest: bool) -> Option<Decision> {
        let fp = self.candidates.get(path)?;
        if fp.size_bytes == 0 {
            return None;
        }
        if matches_exactly(path, pattern) {
            self.decide_active(path, fp, pattern)
        } else {
            self.decide_rotated(path, fp, pattern, oldest)
        }
    }

    fn last_size(&self, path: &str) -> u64 {
        self.previous.get(path).map(|fp| fp.size_bytes).unwrap_or(0)
    }

    fn decide_active(&self, path: &str, fp: &FileFingerprint, pattern: &str) -> Option<Decision> {
        let size = fp.size_bytes;
        match self.last_inodes.get(&fp.inode).copied() {
            Some(last_path) if matches_exactly(last_path, pattern) => {
                let last_size = self.last_size(last_path);
                if size > last_size {
                    Some(Decision::new(path, last_path, last_size, size - last_size, InstructionKind::Growth, Some(last_path)))
                } else if size < last_size {
                    debug!(path, last_size, size, "Rotated by copy-truncate");
                    Some(Decision::new(path, path, 0, size, InstructionKind::Truncated, Some(last_path)))
                } else {
                    None
                }
            }
            _ => Some(Decision::new(path, path, 0, size, InstructionKind::Fresh, None)),
        }
    }

    fn decide_rotated(&self, path: &str, fp: &FileFingerprint, pattern: &str, oldest: bool) -> Option<Decision> {
        let size = fp.size_bytes;

        if let Some(last_path) = self.last_inodes.get(&fp.inode).copied() {
            let last_size = self.last_size(last_path);
            if matches_exactly(last_path, pattern) {
                // renamed by rotation; bytes past the last probe are still uncollected
                if size > last_size {
                    return Some(Decision::new(
                        path,
                        last_path,
                        last_size,
                        size - last_size,
                        InstructionKind::RenamedTail,
                        Some(last_path),
                    ));
                }
                if size < last_size {
                    warn!(from = last_path, to = path, last_size, size, "Renamed log file shrank");
                }
                return None;
            }
            if last_path == path {
                warn!(path, last_size, size, "Rotated log file changed in place");
                return None;
            }
            if matches_by_prefix(last_path, pattern) {
                // rotated again, e.g. log.1 -> log.2
                if size != last_size {
                    warn!(from = last_path, to = path, last_size, size, "Rotated log file changed size");
                }
                return None;
            }
            // the inode belonged to another target last time
        }

        let original = original_path(path, pattern);
        let Some(original_now) = self.current.get(original) else {
            warn!(path, original, "Orphan rotated file");
            return None;
        };
        let Some(original_last) = self.previous.get(original) else {
            // active file created and rotated between two probes
            return Some(Decision::new(path, original, 0, 0, InstructionKind::Unobserved, None));
        };

        if original_now.inode == original_last.inode {
            if original_now.size_bytes >= original_last.size_bytes {
                warn!(path, original, "Found rotated file but original seems not rotated");
                return None;
            }
            return self.rotated_tail(path, original, original_last.size_bytes, oldest);
        }

        let renamed_original = self
            .current
            .files
            .iter()
            .filter(|(_, cur)| cur.inode == original_last.inode)
            .map(|(p, _)| p.as_str())
            .last();
        if renamed_original.is_some_and(|renamed| matches_by_prefix(renamed, pattern)) {
            // previously rotated copy, e.g. log-20181012 -> log-20181012.gz
            if is_compressed(path) {
                debug!(path, "Ignore recompressed rotated file");
            }
            return None;
        }
        if !is_compressed(path) {
            warn!(path, original, "Ignore rotated file with unknown origin");
            return None;
        }
        // original was renamed and compressed in one step
        self.rotated_tail(path, original, original_last.size_bytes, oldest)
    }

    fn rotated_tail(&self, path: &str, original: &str, offset: u64, oldest: bool) -> Option<Decision> {
        if !oldest {
            debug!(path, "Rotated copy already collected");
            return None;
        }
        Some(Decision::new(path, original, offset, 0, InstructionKind::RotatedTail, Some(original)))
    }
}
