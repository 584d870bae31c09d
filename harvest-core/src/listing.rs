//! Remote `ls` output parsing.
//!
//! The listing is the only structured boundary with a managed host, so all
//! knowledge of its format lives here. Each regular file line carries six
//! whitespace-separated fields:
//!
//! ```text
//! <inode> <mode> <links> <size> <mtime> <path>
//! ```
//!
//! A line of the form `<dir>:` switches the directory used for following
//! relative names. Directories and broken links (inode `?`) are dropped.

use crate::model::FileFingerprint;
use tracing::{debug, warn};

/// Separates the listing from the target list in a stored snapshot.
pub const TARGET_SENTINEL: &str = "====== ls targets =======";

/// One regular file parsed from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub path: String,
    pub fingerprint: FileFingerprint,
}

/// Command that lists every stem plus its rotated siblings.
///
/// Stems stay unquoted so the remote shell expands their wildcards.
pub fn listing_command<S: AsRef<str>>(stems: &[S]) -> String {
    let operands: Vec<String> = stems.iter().map(|s| format!("{}*", s.as_ref())).collect();
    format!("/bin/ls -AiLgG --time-style=+%s {}", operands.join(" "))
}

/// Parse listing text up to the target sentinel (if any).
pub fn parse_listing(raw: &str) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    let mut dir = String::new();

    for line in raw.lines() {
        if line == TARGET_SENTINEL {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let fields = split_fields(line, 6);
        if fields.len() == 6 {
            match parse_entry(&fields, &dir) {
                Ok(Some(entry)) => {
                    entries.push(entry);
                    continue;
                }
                Ok(None) => continue,
                Err(reason) => {
                    if !line.ends_with(':') {
                        warn!(line = %line, reason, "Ignoring malformed listing line");
                        continue;
                    }
                }
            }
        }

        if let Some(header) = line.strip_suffix(':') {
            dir = header.trim().to_string();
        } else {
            debug!(line = %line, "Ignoring unrecognised listing line");
        }
    }

    entries
}

/// Split stored snapshot text into its listing part and the target list.
pub fn split_targets(raw: &str) -> (&str, Vec<String>) {
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == TARGET_SENTINEL {
            let targets = raw[offset + line.len()..]
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect();
            return (&raw[..offset], targets);
        }
        offset += line.len();
    }
    (raw, Vec::new())
}

/// Render one entry in listing form.
pub fn render_entry(path: &str, fingerprint: &FileFingerprint) -> String {
    format!(
        "{} - 1 {} {} {}",
        fingerprint.inode, fingerprint.size_bytes, fingerprint.mtime_epoch, path
    )
}

fn parse_entry(
    fields: &[&str],
    dir: &str,
) -> std::result::Result<Option<ListingEntry>, &'static str> {
    let (inode, mode, size, mtime, name) = (fields[0], fields[1], fields[3], fields[4], fields[5]);

    if inode == "?" {
        debug!(name, "Skipping broken link");
        return Ok(None);
    }
    let inode: u64 = inode.parse().map_err(|_| "inode is not numeric")?;
    let size: u64 = size.parse().map_err(|_| "size is not numeric")?;
    let mtime: i64 = mtime.parse().map_err(|_| "mtime is not numeric")?;

    if mode.starts_with('d') {
        return Ok(None);
    }

    let name = name.trim();
    let path = if name.starts_with('/') || dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    };

    Ok(Some(ListingEntry {
        path,
        fingerprint: FileFingerprint::new(inode, size, mtime),
    }))
}

/// Whitespace split with at most `max` fields; the last keeps inner spaces.
fn split_fields(line: &str, max: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(max);
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        if fields.len() + 1 == max {
            fields.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                fields.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                fields.push(rest);
                break;
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(inode: u64, size: u64, mtime: i64) -> FileFingerprint {
        FileFingerprint::new(inode, size, mtime)
    }

    /// Outputs captured from `ls -AiLgG --time-style=+%s` on managed hosts.
    #[test]
    fn test_captured_outputs() {
        let cases: Vec<(&str, &str, Vec<(&str, FileFingerprint)>)> = vec![
            (
                "single file operand",
                "1835017 -rw------- 1 2841297 1700000000 /var/log/messages\n",
                vec![("/var/log/messages", fp(1835017, 2841297, 1700000000))],
            ),
            (
                "rotated siblings with column padding",
                "1835017 -rw-------  1  2841297 1700000000 /var/log/messages\n\
                 1835020 -rw-------  1 10485760 1699900000 /var/log/messages-20231101\n\
                 1835031 -rw-------  1   348190 1699800000 /var/log/messages-20231025.gz\n",
                vec![
                    ("/var/log/messages", fp(1835017, 2841297, 1700000000)),
                    ("/var/log/messages-20231101", fp(1835020, 10485760, 1699900000)),
                    ("/var/log/messages-20231025.gz", fp(1835031, 348190, 1699800000)),
                ],
            ),
            (
                "directory operand switches the current directory",
                "524301 -rw-r--r-- 1 120 1700000100 /var/log/cell.log\n\
                 \n\
                 /opt/oracle/cell/log/diag/asm/cell/cel01/trace:\n\
                 917506 -rw-r----- 1 77012 1700000200 alert.log\n\
                 917507 -rw-r----- 1 5120 1700000300 ms-odl.trc\n",
                vec![
                    ("/var/log/cell.log", fp(524301, 120, 1700000100)),
                    (
                        "/opt/oracle/cell/log/diag/asm/cell/cel01/trace/alert.log",
                        fp(917506, 77012, 1700000200),
                    ),
                    (
                        "/opt/oracle/cell/log/diag/asm/cell/cel01/trace/ms-odl.trc",
                        fp(917507, 5120, 1700000300),
                    ),
                ],
            ),
            (
                "directories and broken links are dropped",
                "393217 drwxr-xr-x 2 4096 1700000000 /var/log/audit\n\
                 ? l????????? ? ? ? /var/log/dangling.log\n\
                 393219 -rw-r--r-- 1 64 1700000001 /var/log/ok.log\n",
                vec![("/var/log/ok.log", fp(393219, 64, 1700000001))],
            ),
            (
                "file names with spaces keep inner whitespace",
                "655361 -rw-r--r-- 1 12 1700000000 /var/log/odd name.log  \n",
                vec![("/var/log/odd name.log", fp(655361, 12, 1700000000))],
            ),
            (
                "garbage and summary lines are ignored",
                "total 48\n\
                 ls: cannot access '/var/log/missing*': No such file or directory\n\
                 abc -rw-r--r-- 1 12 1700000000 /var/log/bad-inode.log\n\
                 655362 -rw-r--r-- 1 twelve 1700000000 /var/log/bad-size.log\n\
                 655363 -rw-r--r-- 1 12 1700000000 /var/log/good.log\n",
                vec![("/var/log/good.log", fp(655363, 12, 1700000000))],
            ),
            ("empty output", "", vec![]),
        ];

        for (name, raw, expected) in cases {
            let parsed = parse_listing(raw);
            let got: Vec<(&str, FileFingerprint)> = parsed
                .iter()
                .map(|e| (e.path.as_str(), e.fingerprint))
                .collect();
            assert_eq!(got, expected, "case: {name}");
        }
    }

    #[test]
    fn test_parse_stops_at_sentinel() {
        let raw = format!(
            "1 -rw-r--r-- 1 10 100 /var/log/a\n{TARGET_SENTINEL}\n/var/log/a\n2 -rw-r--r-- 1 10 100 /var/log/b\n"
        );
        let entries = parse_listing(&raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/var/log/a");
    }

    #[test]
    fn test_split_targets() {
        let raw = format!("1 - 1 10 100 /var/log/a\n{TARGET_SENTINEL}\n/var/log/a\n/u01/*/alert.log\n");
        let (listing, targets) = split_targets(&raw);
        assert_eq!(listing, "1 - 1 10 100 /var/log/a\n");
        assert_eq!(targets, vec!["/var/log/a", "/u01/*/alert.log"]);

        let (listing, targets) = split_targets("1 - 1 10 100 /var/log/a\n");
        assert_eq!(listing, "1 - 1 10 100 /var/log/a\n");
        assert!(targets.is_empty());
    }

    #[test]
    fn test_rendered_entry_parses_back() {
        let line = render_entry("/var/log/odd name.log", &fp(9, 1024, 1700000000));
        let parsed = parse_listing(&line);
        assert_eq!(parsed[0].path, "/var/log/odd name.log");
        assert_eq!(parsed[0].fingerprint, fp(9, 1024, 1700000000));
    }

    #[test]
    fn test_listing_command() {
        let cmd = listing_command(&["/var/log/messages", "/u01/*/alert.log"]);
        assert_eq!(
            cmd,
            "/bin/ls -AiLgG --time-style=+%s /var/log/messages* /u01/*/alert.log*"
        );
    }
}
