//! Maps configured targets to per-host remote globs and local destinations.

use crate::context::HarvestContext;
use crate::model::{HostPlacement, NodeType, TargetPattern};
use crate::pattern::{glob_match, has_wildcard};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use tracing::debug;

const HOSTNAME_PLACEHOLDER: &str = "<hostname>";

/// One target bound to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Remote glob with `<hostname>` substituted.
    pub source: String,
    /// Local destination; may still hold `<idN>` for wildcard sources.
    pub destination: PathBuf,
    pub pattern: TargetPattern,
}

/// Ordered targets of one host. Order is the configured order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTargets {
    targets: Vec<ResolvedTarget>,
}

pub fn short_host(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

/// `dcs-agent.log` -> `dcs-agent-<short-host>-2020-01-21-091731.log`
pub fn forward_file_name(host: &str, filename: &str, at: &DateTime<Local>) -> String {
    let (stem, extension) = match filename.rfind('.') {
        Some(pos) if pos > 0 => filename.split_at(pos),
        _ => (filename, ""),
    };
    format!(
        "{}-{}-{}{}",
        stem,
        short_host(host),
        at.format("%Y-%m-%d-%H%M%S"),
        extension
    )
}

impl ResolvedTargets {
    pub fn resolve(
        ctx: &HarvestContext,
        host: &str,
        node_type: NodeType,
        placement: &HostPlacement,
        patterns: &[TargetPattern],
    ) -> Self {
        let short = short_host(host);
        let mut targets: Vec<ResolvedTarget> = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let source = pattern.source_glob.replace(HOSTNAME_PLACEHOLDER, short);
            if targets.iter().any(|t| t.source == source) {
                debug!(host, source = %source, "Duplicate target ignored");
                continue;
            }
            let filename = pattern.destination_template.replace(HOSTNAME_PLACEHOLDER, short);
            let destination = destination_path(ctx, host, node_type, placement, &pattern.category, &filename);
            debug!(host, source = %source, destination = %destination.display(), "Target log");
            targets.push(ResolvedTarget {
                source,
                destination,
                pattern: pattern.clone(),
            });
        }

        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedTarget> {
        self.targets.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedTarget> {
        self.targets.iter()
    }

    /// Remote globs in configured order; this is the stored target list.
    pub fn sources(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.source.clone()).collect()
    }

    /// Destination for a concrete active path of target `index`.
    ///
    /// Wildcard segments of the source are substituted, in order, for
    /// `<id1>`, `<id2>`, ... in the destination. Paths whose segment count
    /// differs from the source are not routable.
    pub fn destination_for(&self, index: usize, key_path: &str) -> Option<PathBuf> {
        let target = self.targets.get(index)?;
        if key_path == target.source {
            return Some(target.destination.clone());
        }
        if !has_wildcard(&target.source) || !glob_match(&target.source, key_path) {
            return None;
        }

        let source_segments: Vec<&str> = target.source.split('/').collect();
        let path_segments: Vec<&str> = key_path.split('/').collect();
        if source_segments.len() != path_segments.len() {
            debug!(source = %target.source, path = key_path, "Ignore path with different depth");
            return None;
        }

        let mut destination = target.destination.to_string_lossy().into_owned();
        let differing = source_segments
            .iter()
            .zip(&path_segments)
            .filter(|(source, concrete)| source != concrete)
            .map(|(_, concrete)| *concrete);
        for (i, segment) in differing.enumerate() {
            destination = destination.replace(&format!("<id{}>", i + 1), segment);
        }
        Some(PathBuf::from(destination))
    }
}

fn destination_path(
    ctx: &HarvestContext,
    host: &str,
    node_type: NodeType,
    placement: &HostPlacement,
    category: &str,
    filename: &str,
) -> PathBuf {
    let base = ctx.job_root.join(category);
    match node_type {
        NodeType::Compute | NodeType::Storage => base
            .join(&placement.cabinet)
            .join(&placement.rack)
            .join(host)
            .join(filename),
        NodeType::Guest => match &ctx.forward_repo {
            Some(repo) if ctx.forward_categories.iter().any(|c| c == category) => {
                repo.join(forward_file_name(host, filename, &ctx.started_at))
            }
            _ => base
                .join(&placement.cabinet)
                .join(&placement.rack)
                .join(&placement.cluster)
                .join(host)
                .join(filename),
        },
        NodeType::Switch => base.join(&placement.cabinet).join(host).join(filename),
        NodeType::Management => base.join(host).join(filename),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> HarvestContext {
        HarvestContext::new("job-7", "/srv", "/var/cache/harvest")
    }

    fn placement() -> HostPlacement {
        HostPlacement {
            cabinet: "cab1".into(),
            rack: "rack2".into(),
            cluster: "clu3".into(),
        }
    }

    #[test]
    fn test_layout_per_node_type() {
        let patterns = vec![TargetPattern::new("/var/log/messages", "rack_messages", "messages")];
        let results = "/srv/diagnostic/results/job-7/rack_messages";

        let cases = [
            (NodeType::Compute, format!("{results}/cab1/rack2/dom0a.example.com/messages")),
            (NodeType::Storage, format!("{results}/cab1/rack2/dom0a.example.com/messages")),
            (NodeType::Guest, format!("{results}/cab1/rack2/clu3/dom0a.example.com/messages")),
            (NodeType::Switch, format!("{results}/cab1/dom0a.example.com/messages")),
            (NodeType::Management, format!("{results}/dom0a.example.com/messages")),
        ];
        for (node_type, expected) in cases {
            let targets = ResolvedTargets::resolve(&ctx(), "dom0a.example.com", node_type, &placement(), &patterns);
            assert_eq!(
                targets.destination_for(0, "/var/log/messages"),
                Some(PathBuf::from(expected)),
                "{node_type}"
            );
        }
    }

    #[test]
    fn test_hostname_placeholder_uses_short_name() {
        let patterns = vec![TargetPattern::new(
            "/opt/oracle/cell/log/diag/asm/cell/<hostname>/trace/alert.log",
            "rack_alert",
            "<hostname>-alert.log",
        )];
        let targets = ResolvedTargets::resolve(&ctx(), "cel01.example.com", NodeType::Storage, &placement(), &patterns);
        assert_eq!(
            targets.sources(),
            vec!["/opt/oracle/cell/log/diag/asm/cell/cel01/trace/alert.log".to_string()]
        );
        assert!(targets.get(0).unwrap().destination.ends_with("cel01.example.com/cel01-alert.log"));
    }

    #[test]
    fn test_positional_wildcards() {
        let patterns = vec![TargetPattern::new("/u01/diag/rdbms/*/trace/alert_*.log", "rack_alert", "<id1>_<id2>")];
        let targets = ResolvedTargets::resolve(&ctx(), "vm1", NodeType::Compute, &placement(), &patterns);

        let dest = targets.destination_for(0, "/u01/diag/rdbms/db95ad8d/trace/alert_db1.log").unwrap();
        assert!(dest.ends_with("vm1/db95ad8d_alert_db1.log"));

        assert!(targets.destination_for(0, "/u01/diag/rdbms/a/b/trace/alert_x.log").is_none());
        assert!(targets.destination_for(0, "/var/log/messages").is_none());
    }

    #[test]
    fn test_forward_category_naming() {
        let mut ctx = ctx().with_forward_repo("/srv/forward", vec!["rack_dcs-agent".into()]);
        ctx.started_at = Local.with_ymd_and_hms(2020, 1, 21, 9, 17, 31).unwrap();
        let patterns = vec![TargetPattern::new("/opt/dcs/log/dcs-agent.log", "rack_dcs-agent", "dcs-agent.log")];
        let targets = ResolvedTargets::resolve(&ctx, "vm01.example.com", NodeType::Guest, &placement(), &patterns);
        assert_eq!(
            targets.get(0).unwrap().destination,
            PathBuf::from("/srv/forward/dcs-agent-vm01-2020-01-21-091731.log")
        );
    }

    #[test]
    fn test_forward_name_without_extension() {
        let at = Local.with_ymd_and_hms(2020, 1, 21, 9, 17, 31).unwrap();
        assert_eq!(forward_file_name("h.x", "messages", &at), "messages-h-2020-01-21-091731");
        assert_eq!(forward_file_name("h", ".hidden", &at), ".hidden-h-2020-01-21-091731");
    }
}
