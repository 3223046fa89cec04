//! Persisted provisioning state

use crate::node::NodeMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle status of a provisioned resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Nothing has been provisioned
    #[default]
    Absent,
    /// An apply is in progress (or was interrupted)
    Creating,
    /// Provisioned; outputs are valid for `input_hash`
    Ready,
    /// The last apply or delete failed
    Failed,
    /// A delete is in progress (or was interrupted)
    Deleting,
}

impl RecordStatus {
    /// Status of an optional record, `Absent` when there is none
    pub fn of(record: Option<&ProvisionRecord>) -> Self {
        record.map_or(Self::Absent, |r| r.status)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// BLAKE3 hash of a node's kind and resolved inputs, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputHash(String);

impl InputHash {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for InputHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State store entry for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRecord {
    pub id: String,
    pub kind: String,
    pub provider: String,

    #[serde(default)]
    pub mode: NodeMode,

    /// Hash of the inputs the outputs were captured for; unset until the first
    /// successful apply
    #[serde(default)]
    pub input_hash: Option<InputHash>,

    /// Resolved inputs of the last successful apply
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,

    /// Output fields that must not be displayed
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub secret_outputs: BTreeSet<String>,

    pub status: RecordStatus,

    #[serde(default)]
    pub protect: bool,

    /// Dependencies at the time of the last run, used to order deletions once
    /// the node is no longer declared
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<String>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Earlier instances replaced by this one and not yet deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<ProvisionRecord>,
}

impl ProvisionRecord {
    /// A record for a node whose first apply is starting
    pub fn pending(id: impl Into<String>, kind: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            provider: provider.into(),
            mode: NodeMode::Managed,
            input_hash: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            secret_outputs: BTreeSet::new(),
            status: RecordStatus::Creating,
            protect: false,
            dependencies: BTreeSet::new(),
            updated_at: Utc::now(),
            last_error: None,
            superseded: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == RecordStatus::Ready
    }

    /// Whether a successful apply has ever been recorded
    pub fn was_provisioned(&self) -> bool {
        self.input_hash.is_some()
    }

    /// A first create that failed: nothing exists to delete
    pub fn never_created(&self) -> bool {
        !self.was_provisioned() && self.status == RecordStatus::Failed
    }

    /// Whether the captured outputs are valid for `kind` and `hash`
    pub fn is_current(&self, kind: &str, hash: &InputHash) -> bool {
        self.is_ready() && self.kind == kind && self.input_hash.as_ref() == Some(hash)
    }

    /// Store a successful apply
    pub fn capture(
        &mut self,
        hash: InputHash,
        inputs: BTreeMap<String, Value>,
        outputs: BTreeMap<String, Value>,
        secret_outputs: BTreeSet<String>,
    ) {
        self.input_hash = Some(hash);
        self.inputs = inputs;
        self.outputs = outputs;
        self.secret_outputs = secret_outputs;
        self.status = RecordStatus::Ready;
        self.last_error = None;
        self.touch();
    }

    pub fn mark(&mut self, status: RecordStatus) {
        self.status = status;
        self.touch();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RecordStatus::Failed;
        self.last_error = Some(error.into());
        self.touch();
    }

    pub fn is_secret(&self, field: &str) -> bool {
        self.secret_outputs.contains(field)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
