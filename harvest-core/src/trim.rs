//! Cutting an appended file back to its last complete record.

use crate::error::{HarvestError, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

const INITIAL_WINDOW: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimOutcome {
    pub final_size: u64,
    /// Bytes cut off; they are re-fetched on the next pass.
    pub deferred: u64,
}

/// Truncate `path` just past its last record boundary.
///
/// With `start_pattern`, records begin at a line starting with it; otherwise
/// records end with `end_pattern`. A file with no boundary at all is emptied.
pub fn trim(path: &Path, start_pattern: Option<&str>, end_pattern: &str) -> Result<TrimOutcome> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| HarvestError::storage(path, e))?;
    let size = file
        .metadata()
        .map_err(|e| HarvestError::storage(path, e))?
        .len();
    let untouched = TrimOutcome { final_size: size, deferred: 0 };

    if size == 0 || end_pattern.is_empty() {
        return Ok(untouched);
    }

    let end = end_pattern.as_bytes();
    if size >= end.len() as u64 {
        let mut tail = vec![0u8; end.len()];
        file.seek(SeekFrom::Start(size - end.len() as u64))
            .and_then(|_| file.read_exact(&mut tail))
            .map_err(|e| HarvestError::storage(path, e))?;
        if tail == end {
            return Ok(untouched);
        }
    }

    let new_size = match start_pattern.filter(|s| !s.is_empty()) {
        Some(start) => {
            let needle = format!("\n{start}");
            find_last(&mut file, size, needle.as_bytes())
                .map_err(|e| HarvestError::storage(path, e))?
                .map(|pos| pos + 1)
        }
        None => find_last(&mut file, size, end)
            .map_err(|e| HarvestError::storage(path, e))?
            .map(|pos| pos + end.len() as u64),
    }
    .unwrap_or(0);

    file.set_len(new_size)
        .map_err(|e| HarvestError::storage(path, e))?;
    debug!(path = %path.display(), size, new_size, "Truncated incomplete record");

    Ok(TrimOutcome {
        final_size: new_size,
        deferred: size - new_size,
    })
}

/// Absolute position of the last occurrence of `needle`, scanning backward
/// in doubling windows.
fn find_last<F: Read + Seek>(file: &mut F, size: u64, needle: &[u8]) -> std::io::Result<Option<u64>> {
    if needle.is_empty() || (needle.len() as u64) > size {
        return Ok(None);
    }
    let overlap = needle.len() as u64 - 1;
    let mut window = INITIAL_WINDOW;
    let mut end = size;

    loop {
        let start = end.saturating_sub(window);
        // extend past `end` so matches straddling the window edge are seen
        let read_end = (end + overlap).min(size);
        let mut buf = vec![0u8; (read_end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;

        if let Some(pos) = buf
            .windows(needle.len())
            .rposition(|candidate| candidate == needle)
        {
            return Ok(Some(start + pos as u64));
        }
        if start == 0 {
            return Ok(None);
        }
        end = start;
        window = window.saturating_mul(2);
    }
}
