//! Data model shared by every harvesting stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// State of one remote file at a single probe instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub inode: u64,
    pub size_bytes: u64,
    pub mtime_epoch: i64,
}

impl FileFingerprint {
    pub fn new(inode: u64, size_bytes: u64, mtime_epoch: i64) -> Self {
        Self {
            inode,
            size_bytes,
            mtime_epoch,
        }
    }
}

/// One configured family of files to harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPattern {
    /// Remote glob; may contain `<hostname>` and positional wildcards.
    #[serde(rename = "source")]
    pub source_glob: String,

    pub category: String,

    /// Destination file name; may contain `<hostname>` and `<idN>`.
    #[serde(rename = "filename")]
    pub destination_template: String,

    /// Command run on the host before probing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(
        rename = "start_of_msg",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub record_start_pattern: Option<String>,

    #[serde(rename = "end_of_msg", default = "default_record_end")]
    pub record_end_pattern: String,

    /// Copied whole on every pass instead of tracked incrementally
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub copy: bool,
}

fn default_record_end() -> String {
    "\n".to_string()
}

impl TargetPattern {
    pub fn new(
        source_glob: impl Into<String>,
        category: impl Into<String>,
        destination_template: impl Into<String>,
    ) -> Self {
        Self {
            source_glob: source_glob.into(),
            category: category.into(),
            destination_template: destination_template.into(),
            command: None,
            record_start_pattern: None,
            record_end_pattern: default_record_end(),
            copy: false,
        }
    }
}

/// Which rotation case produced an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    /// Active file grew in place.
    Growth,
    /// Active file shrank under the same inode (copy-truncate).
    Truncated,
    /// Active file is new or was recreated after a rename.
    Fresh,
    /// Renamed sibling still carries bytes written before the rename.
    RenamedTail,
    /// Rotated copy holds the tail written before the active file was truncated.
    RotatedTail,
    /// Rotated sibling whose active file was never observed before.
    Unobserved,
}

impl InstructionKind {
    /// True when the source is the active (exact-match) file.
    pub fn targets_active(self) -> bool {
        matches!(
            self,
            InstructionKind::Growth | InstructionKind::Truncated | InstructionKind::Fresh
        )
    }
}

/// One byte range to append to a local destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInstruction {
    pub source_path: String,
    pub destination_path: PathBuf,
    pub offset_bytes: u64,
    /// `0` means "rest of file".
    pub length_bytes: u64,
    pub kind: InstructionKind,
    /// Index of the resolved target that produced this instruction.
    pub target_index: usize,
    /// Previous-pass path whose fingerprint anchors `offset_bytes`.
    pub baseline_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Compute,
    Guest,
    Storage,
    Switch,
    Management,
}

impl NodeType {
    /// Pass order.
    pub const ALL: [NodeType; 5] = [
        NodeType::Compute,
        NodeType::Guest,
        NodeType::Storage,
        NodeType::Switch,
        NodeType::Management,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Compute => "compute",
            NodeType::Guest => "guest",
            NodeType::Storage => "storage",
            NodeType::Switch => "switch",
            NodeType::Management => "management",
        }
    }

    pub fn is_local(self) -> bool {
        self == NodeType::Management
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compute" | "dom0" => Ok(NodeType::Compute),
            "guest" | "domu" => Ok(NodeType::Guest),
            "storage" | "cell" => Ok(NodeType::Storage),
            "switch" => Ok(NodeType::Switch),
            "management" | "cps" => Ok(NodeType::Management),
            other => Err(format!("unknown node type: {other}")),
        }
    }
}

/// Where a host sits in the physical topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPlacement {
    #[serde(default = "default_trunk")]
    pub cabinet: String,
    #[serde(default = "default_trunk")]
    pub rack: String,
    #[serde(default)]
    pub cluster: String,
}

fn default_trunk() -> String {
    "trunk".to_string()
}

impl Default for HostPlacement {
    fn default() -> Self {
        Self {
            cabinet: default_trunk(),
            rack: default_trunk(),
            cluster: String::new(),
        }
    }
}
