//! Per-node outcomes and run summaries

use crate::error::{FailureCause, NodeFailure};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What happened to one node during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// First successful apply
    Created,
    /// Updated in place
    Updated,
    /// Deleted and created again
    Replaced,
    /// Inputs matched the recorded hash; the provider was not called
    Unchanged,
    /// Lookup node read from the provider
    Read,
    /// Removed from the provider and the store
    Deleted,
    /// Left in place during the deletion pass
    Retained { reason: String },
    Failed { failure: NodeFailure },
    /// Never started because the run was cancelled
    Cancelled,
}

impl NodeOutcome {
    pub fn failed(node: impl Into<String>, cause: FailureCause) -> Self {
        Self::Failed {
            failure: NodeFailure::new(node, cause),
        }
    }

    /// Whether the node ended the run `ready`
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Unchanged | Self::Read
        )
    }

    /// Whether a provider mutation took place
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted
        )
    }

    pub fn failure(&self) -> Option<&NodeFailure> {
        match self {
            Self::Failed { failure } => Some(failure),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Replaced => "replaced",
            Self::Unchanged => "unchanged",
            Self::Read => "read",
            Self::Deleted => "deleted",
            Self::Retained { .. } => "retained",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retained { reason } => write!(f, "retained ({reason})"),
            Self::Failed { failure } => write!(f, "failed: {}", failure.cause),
            other => f.write_str(other.label()),
        }
    }
}

/// Report for one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub id: String,
    pub kind: String,
    pub outcome: NodeOutcome,
    /// Outputs recorded at the end of the run
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub secret_outputs: BTreeSet<String>,
}

impl NodeReport {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, outcome: NodeOutcome) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            outcome,
            outputs: BTreeMap::new(),
            secret_outputs: BTreeSet::new(),
        }
    }

    pub fn is_secret(&self, output: &str) -> bool {
        self.secret_outputs.contains(output)
    }
}

/// Resolved value of a deployment export
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExportValue {
    Known {
        value: Value,
        /// Derived from a secret output
        secret: bool,
    },
    /// A producer did not reach `ready`
    Unavailable { reason: String },
}

impl ExportValue {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Known { value, .. } => Some(value),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Known { secret: true, .. })
    }
}

/// Counts of outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub read: usize,
    pub deleted: usize,
    pub retained: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    /// Total number of provider mutations
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Total number of nodes counted
    pub fn total(&self) -> usize {
        self.total_changes()
            + self.unchanged
            + self.read
            + self.retained
            + self.failed
            + self.cancelled
    }

    pub fn add(&mut self, outcome: &NodeOutcome) {
        match outcome {
            NodeOutcome::Created => self.created += 1,
            NodeOutcome::Updated => self.updated += 1,
            NodeOutcome::Replaced => self.replaced += 1,
            NodeOutcome::Unchanged => self.unchanged += 1,
            NodeOutcome::Read => self.read += 1,
            NodeOutcome::Deleted => self.deleted += 1,
            NodeOutcome::Retained { .. } => self.retained += 1,
            NodeOutcome::Failed { .. } => self.failed += 1,
            NodeOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub deployment: String,
    /// Declared nodes, in declaration order
    pub nodes: Vec<NodeReport>,
    /// Recorded nodes that left the declaration set, in deletion order
    pub deletions: Vec<NodeReport>,
    pub exports: BTreeMap<String, ExportValue>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Every declared node is ready and no deletion failed
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.outcome.is_ready())
            && !self
                .deletions
                .iter()
                .any(|n| matches!(n.outcome, NodeOutcome::Failed { .. } | NodeOutcome::Cancelled))
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for report in self.nodes.iter().chain(&self.deletions) {
            counts.add(&report.outcome);
        }
        counts
    }

    /// Report for `id`, declared or removed
    pub fn get(&self, id: &str) -> Option<&NodeReport> {
        self.nodes
            .iter()
            .chain(&self.deletions)
            .find(|report| report.id == id)
    }

    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.get(id).map(|report| &report.outcome)
    }

    pub fn failures(&self) -> Vec<&NodeFailure> {
        self.nodes
            .iter()
            .chain(&self.deletions)
            .filter_map(|report| report.outcome.failure())
            .collect()
    }

    /// Value of an export, when known
    pub fn export(&self, name: &str) -> Option<&Value> {
        self.exports.get(name).and_then(ExportValue::value)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use serde_json::json;

    fn summary(nodes: Vec<NodeReport>, deletions: Vec<NodeReport>) -> RunSummary {
        let now = Utc::now();
        RunSummary {
            deployment: "ci".into(),
            nodes,
            deletions,
            exports: BTreeMap::new(),
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_counts_and_changes() {
        let run = summary(
            vec![
                NodeReport::new("vpc", "vpc", NodeOutcome::Created),
                NodeReport::new("cluster", "eks", NodeOutcome::Unchanged),
                NodeReport::new(
                    "volume",
                    "ebs",
                    NodeOutcome::failed("volume", FailureCause::ProtectedReplace),
                ),
            ],
            vec![NodeReport::new("old", "ebs", NodeOutcome::Deleted)],
        );

        let counts = run.counts();
        assert_eq!(counts.created, 1);
        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.deleted, 1);
        assert_eq!(counts.total_changes(), 2);
        assert_eq!(counts.total(), 4);
        assert!(!run.is_success());
        assert_eq!(run.failures().len(), 1);
    }

    #[test]
    fn test_retained_deletion_is_still_success() {
        let run = summary(
            vec![NodeReport::new("vpc", "vpc", NodeOutcome::Unchanged)],
            vec![NodeReport::new(
                "data",
                "ebs",
                NodeOutcome::Retained {
                    reason: "protected".into(),
                },
            )],
        );
        assert!(run.is_success());
        assert_eq!(
            run.outcome("data").map(ToString::to_string).as_deref(),
            Some("retained (protected)")
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = NodeOutcome::failed(
            "volume",
            FailureCause::Provider {
                error: ProviderError::fatal("quota"),
            },
        );
        let encoded = serde_json::to_value(&outcome).unwrap();
        assert_eq!(encoded["outcome"], "failed");
        assert_eq!(encoded["failure"]["node"], "volume");
        assert_eq!(encoded["failure"]["cause"]["cause"], "provider");
        assert_eq!(encoded["failure"]["cause"]["error"]["kind"], "fatal");
    }

    #[test]
    fn test_export_values() {
        let known = ExportValue::Known {
            value: json!("AKIA"),
            secret: true,
        };
        assert!(known.is_secret());
        assert_eq!(known.value(), Some(&json!("AKIA")));
        assert_eq!(
            ExportValue::Unavailable {
                reason: "x".into()
            }
            .value(),
            None
        );
    }
}
