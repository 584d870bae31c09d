//! Target glob matching and rotated-sibling ordering.
//!
//! Globs use fnmatch semantics: `*` also crosses `/`.

use glob::Pattern;
use std::cmp::Reverse;

/// Suffix numbers above this are read as dates (`messages-20231101`).
const DATE_SUFFIX_THRESHOLD: u64 = 20_000_000;

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// fnmatch-style match; an invalid glob only matches itself.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(path),
        Err(_) => pattern == path,
    }
}

/// `path` is the active file named by `pattern` (no rotation suffix).
pub fn matches_exactly(path: &str, pattern: &str) -> bool {
    if has_wildcard(pattern) {
        glob_match(pattern, path)
    } else {
        path == pattern
    }
}

/// `path` is the active file or one of its suffixed siblings.
pub fn matches_by_prefix(path: &str, pattern: &str) -> bool {
    if has_wildcard(pattern) {
        glob_match(&format!("{pattern}*"), path)
    } else {
        path.starts_with(pattern)
    }
}

/// Byte index in `path` where the rotation suffix begins.
pub fn suffix_position(path: &str, pattern: &str) -> usize {
    if !has_wildcard(pattern) {
        return pattern.len().min(path.len());
    }
    let last_wildcard = pattern
        .rfind('*')
        .into_iter()
        .chain(pattern.rfind('?'))
        .max()
        .unwrap_or(0);
    let tail = &pattern[last_wildcard + 1..];
    if tail.is_empty() {
        return path.len();
    }
    path.rfind(tail)
        .map(|pos| pos + tail.len())
        .unwrap_or(path.len())
}

pub fn rotation_suffix<'a>(path: &'a str, pattern: &str) -> &'a str {
    let pos = suffix_position(path, pattern);
    path.get(pos..).unwrap_or("")
}

/// Active path a rotated sibling was derived from.
pub fn original_path<'a>(path: &'a str, pattern: &str) -> &'a str {
    let pos = suffix_position(path, pattern);
    path.get(..pos).unwrap_or(path)
}

pub fn is_compressed(path: &str) -> bool {
    path.ends_with(".gz")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RotationScheme {
    /// `log-20231101`: smaller number is older, active file last.
    Dated,
    /// `log.1`, `log.2`: larger number is older.
    Ordinal,
    Lexical,
}

fn last_number(s: &str) -> Option<u64> {
    let mut last = None;
    let mut current = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            last = Some(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        last = Some(current);
    }
    last.map(|digits| digits.parse().unwrap_or(u64::MAX))
}

fn detect_scheme(sorted: &[String], pattern: &str) -> RotationScheme {
    for path in sorted {
        if let Some(n) = last_number(rotation_suffix(path, pattern)) {
            return if n > DATE_SUFFIX_THRESHOLD {
                RotationScheme::Dated
            } else {
                RotationScheme::Ordinal
            };
        }
    }
    RotationScheme::Lexical
}

/// Order the files matched by `pattern*` oldest data first.
pub fn sort_rotated(mut paths: Vec<String>, pattern: &str) -> Vec<String> {
    paths.sort();
    if paths.len() < 2 {
        return paths;
    }

    match detect_scheme(&paths, pattern) {
        RotationScheme::Dated => {
            paths.sort_by_key(|p| matches_exactly(p, pattern));
        }
        RotationScheme::Ordinal => {
            paths.sort_by_key(|p| {
                let active = matches_exactly(p, pattern);
                let age = last_number(rotation_suffix(p, pattern)).unwrap_or(u64::MAX);
                (active, Reverse(age))
            });
        }
        RotationScheme::Lexical => {}
    }
    paths
}
