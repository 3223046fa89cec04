//! Planned changes, computed without calling `apply` or `delete`

use crate::error::Result;
use crate::executor::Reconciler;
use crate::graph::Dag;
use crate::node::{DeclarationSet, NodeMode, ResourceNode};
use crate::record::ProvisionRecord;
use crate::resolve::{ResolvedInputs, Resolver, hash_inputs};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// What a run would do to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    Create,
    /// Update in place; `inputs_known` is false when an upstream change makes
    /// the final inputs unknowable until the run
    Update { inputs_known: bool },
    Replace,
    NoChange,
    Read,
    Delete,
    Retain { reason: String },
    /// The run would fail this node
    Conflict { reason: String },
}

impl PlannedAction {
    /// Whether outputs seen by dependents may change
    fn may_change_outputs(&self) -> bool {
        matches!(self, Self::Create | Self::Update { .. } | Self::Replace)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update { .. } => "~",
            Self::Replace => "±",
            Self::NoChange => "=",
            Self::Read => "<",
            Self::Delete => "-",
            Self::Retain { .. } => "!",
            Self::Conflict { .. } => "x",
        }
    }
}

/// Planned action for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedNode {
    pub id: String,
    pub kind: String,
    pub action: PlannedAction,
    /// Input names whose resolved value differs from the record
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_inputs: Vec<String>,
}

impl PlannedNode {
    fn new(id: &str, kind: &str, action: PlannedAction) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            action,
            changed_inputs: Vec::new(),
        }
    }
}

/// Planned actions for a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub deployment: String,
    /// Declared nodes, in execution order
    pub nodes: Vec<PlannedNode>,
    /// Recorded nodes that are no longer declared, in deletion order
    pub deletions: Vec<PlannedNode>,
}

impl Preview {
    pub fn get(&self, id: &str) -> Option<&PlannedNode> {
        self.nodes.iter().chain(&self.deletions).find(|n| n.id == id)
    }

    pub fn action(&self, id: &str) -> Option<&PlannedAction> {
        self.get(id).map(|n| &n.action)
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary::from_nodes(self.nodes.iter().chain(&self.deletions))
    }
}

/// Plan summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub replaces: usize,
    pub deletes: usize,
    pub unchanged: usize,
    pub reads: usize,
    pub retains: usize,
    pub conflicts: usize,
}

impl PlanSummary {
    fn from_nodes<'a>(nodes: impl Iterator<Item = &'a PlannedNode>) -> Self {
        let mut summary = Self::default();
        for node in nodes {
            match node.action {
                PlannedAction::Create => summary.creates += 1,
                PlannedAction::Update { .. } => summary.updates += 1,
                PlannedAction::Replace => summary.replaces += 1,
                PlannedAction::NoChange => summary.unchanged += 1,
                PlannedAction::Read => summary.reads += 1,
                PlannedAction::Delete => summary.deletes += 1,
                PlannedAction::Retain { .. } => summary.retains += 1,
                PlannedAction::Conflict { .. } => summary.conflicts += 1,
            }
        }
        summary
    }

    /// Total number of provider mutations
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

impl Reconciler {
    /// Compute what [`Reconciler::reconcile`] would do
    ///
    /// Runs the same validation but never calls `apply`, `read` or `delete`
    /// and never writes the store.
    pub fn preview(&self, declarations: &DeclarationSet) -> Result<Preview> {
        let plan = self.validate(declarations)?;
        let store = self.run().store.as_ref();
        let resolver = Resolver::new(store);
        let by_id: HashMap<&str, &ResourceNode> = declarations
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), node))
            .collect();

        let deletions = plan_deletions(&plan.removed, &plan.removal_dag)?;
        let held = held_by_retained(&plan.removed, &deletions);

        let mut pending: HashSet<String> = HashSet::new();
        let mut nodes = Vec::with_capacity(declarations.nodes.len());
        for id in plan.dag.topological_order()? {
            let node = by_id[id.as_str()];
            let previous = store.get(&id)?;
            let upstream_pending = plan
                .dag
                .dependencies_of(&id)
                .into_iter()
                .any(|dependency| pending.contains(dependency));
            let planned = self.plan_node(
                node,
                previous.as_ref(),
                &resolver,
                upstream_pending,
                held.get(id.as_str()).copied(),
            );
            let unread_lookup = planned.action == PlannedAction::Read
                && !previous.as_ref().is_some_and(ProvisionRecord::is_ready);
            if planned.action.may_change_outputs() || unread_lookup {
                pending.insert(id);
            }
            nodes.push(planned);
        }

        Ok(Preview {
            deployment: self.run().name.clone(),
            nodes,
            deletions,
        })
    }

    fn plan_node(
        &self,
        node: &ResourceNode,
        previous: Option<&ProvisionRecord>,
        resolver: &Resolver<'_>,
        upstream_pending: bool,
        held_by: Option<&str>,
    ) -> PlannedNode {
        let planned = |action| PlannedNode::new(&node.id, &node.kind, action);
        if node.mode == NodeMode::Lookup {
            return planned(PlannedAction::Read);
        }
        let Some(record) = previous.filter(|r| r.was_provisioned()) else {
            return planned(PlannedAction::Create);
        };
        let protected = node.protect || record.protect;
        let replace = |planned_node: PlannedNode| {
            let reason = if protected {
                "change requires replacing protected resource".to_string()
            } else if let Some(dependent) = held_by.filter(|_| node.delete_before_replace) {
                format!("cannot replace before dependent '{dependent}' is deleted")
            } else {
                return planned_node;
            };
            PlannedNode {
                action: PlannedAction::Conflict { reason },
                ..planned_node
            }
        };

        if upstream_pending {
            if record.kind != node.kind {
                return replace(planned(PlannedAction::Replace));
            }
            return planned(PlannedAction::Update {
                inputs_known: false,
            });
        }

        let inputs = match resolver.resolve(node) {
            Ok(inputs) => inputs,
            Err(err) => {
                return planned(PlannedAction::Conflict {
                    reason: err.to_string(),
                });
            }
        };
        let hash = hash_inputs(&node.kind, &inputs);
        if record.is_current(&node.kind, &hash) {
            return planned(PlannedAction::NoChange);
        }

        let requires_replace = record.kind != node.kind
            || self
                .run()
                .providers
                .get(&node.provider)
                .is_some_and(|provider| provider.requires_replace(&node.kind, record, &inputs));
        let mut planned_node = if requires_replace {
            replace(planned(PlannedAction::Replace))
        } else {
            planned(PlannedAction::Update { inputs_known: true })
        };
        planned_node.changed_inputs = changed_inputs(&record.inputs, &inputs);
        planned_node
    }
}

fn plan_deletions(removed: &[ProvisionRecord], removal_dag: &Dag) -> Result<Vec<PlannedNode>> {
    let by_id: HashMap<&str, &ProvisionRecord> =
        removed.iter().map(|record| (record.id.as_str(), record)).collect();
    let order = removal_dag.reversed();
    let mut retained: HashSet<String> = HashSet::new();
    let mut deletions = Vec::with_capacity(removed.len());

    for id in order.topological_order()? {
        let record = by_id[id.as_str()];
        let blocker = order
            .dependencies_of(&id)
            .into_iter()
            .find(|dependent| retained.contains(*dependent));
        let action = if record.protect {
            PlannedAction::Retain {
                reason: "protected".to_string(),
            }
        } else if let Some(dependent) = blocker {
            PlannedAction::Retain {
                reason: format!("dependent '{dependent}' is retained"),
            }
        } else {
            PlannedAction::Delete
        };
        if matches!(action, PlannedAction::Retain { .. }) {
            retained.insert(id.clone());
        }
        deletions.push(PlannedNode::new(&id, &record.kind, action));
    }
    Ok(deletions)
}

/// Declared nodes used by a removed record that will be retained
fn held_by_retained<'a>(removed: &'a [ProvisionRecord], deletions: &[PlannedNode]) -> HashMap<&'a str, &'a str> {
    let retained: HashSet<&str> = deletions
        .iter()
        .filter(|planned| matches!(planned.action, PlannedAction::Retain { .. }))
        .map(|planned| planned.id.as_str())
        .collect();
    removed
        .iter()
        .filter(|record| retained.contains(record.id.as_str()))
        .flat_map(|record| {
            record
                .dependencies
                .iter()
                .map(|dependency| (dependency.as_str(), record.id.as_str()))
        })
        .collect()
}

fn changed_inputs(previous: &ResolvedInputs, next: &ResolvedInputs) -> Vec<String> {
    let names: BTreeSet<&String> = previous
        .keys()
        .chain(next.keys())
        .filter(|name| previous.get(*name) != next.get(*name))
        .collect();
    names.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeploymentRun;
    use crate::provider::ProviderRegistry;
    use crate::store::MemoryStore;
    use crate::testing::{FakeProvider, Op};
    use crate::value::Input;
    use std::sync::Arc;

    fn setup(provider: FakeProvider) -> (Reconciler, Arc<FakeProvider>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let mut registry = ProviderRegistry::new();
        registry.register("default", provider.clone());
        let run = DeploymentRun::new("preview", store.clone(), Arc::new(registry));
        (Reconciler::new(run), provider, store)
    }

    fn stack(size: i64) -> DeclarationSet {
        DeclarationSet::new()
            .with(ResourceNode::new("volume", "ebs").input("size", Input::literal(size)))
            .with(ResourceNode::new("deployment", "k8s:deployment").input("volumeID", Input::output("volume", "id")))
            .with(ResourceNode::new("zone", "cloudflare:Zone").lookup())
    }

    #[test]
    fn test_fresh_deployment_creates_everything() {
        let (reconciler, provider, store) = setup(FakeProvider::new());

        let preview = reconciler.preview(&stack(100)).unwrap();

        assert_eq!(preview.action("volume"), Some(&PlannedAction::Create));
        assert_eq!(preview.action("deployment"), Some(&PlannedAction::Create));
        assert_eq!(preview.action("zone"), Some(&PlannedAction::Read));
        assert_eq!(preview.summary().creates, 2);
        assert!(provider.calls().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_converged_deployment_has_no_changes() {
        let (reconciler, provider, _) = setup(FakeProvider::new());
        reconciler.reconcile(&stack(100)).unwrap();
        provider.clear_calls();

        let preview = reconciler.preview(&stack(100)).unwrap();

        assert_eq!(preview.action("volume"), Some(&PlannedAction::NoChange));
        assert_eq!(preview.action("deployment"), Some(&PlannedAction::NoChange));
        assert!(!preview.summary().has_changes());
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_upstream_update_makes_inputs_unknown() {
        let (reconciler, _, _) = setup(FakeProvider::new());
        reconciler.reconcile(&stack(100)).unwrap();

        let preview = reconciler.preview(&stack(200)).unwrap();

        let volume = preview.get("volume").unwrap();
        assert_eq!(volume.action, PlannedAction::Update { inputs_known: true });
        assert_eq!(volume.changed_inputs, vec!["size"]);
        assert_eq!(
            preview.action("deployment"),
            Some(&PlannedAction::Update {
                inputs_known: false
            })
        );
    }

    #[test]
    fn test_protected_replace_is_a_conflict() {
        let (reconciler, _, _) = setup(FakeProvider::new().replace_on("az"));
        let declared = |az: &str| {
            DeclarationSet::new().with(ResourceNode::new("data", "ebs").input("az", az).protected())
        };
        reconciler.reconcile(&declared("us-east-1a")).unwrap();

        let preview = reconciler.preview(&declared("us-east-1b")).unwrap();

        assert!(matches!(preview.action("data"), Some(PlannedAction::Conflict { .. })));
        assert_eq!(preview.summary().conflicts, 1);
    }

    #[test]
    fn test_replace_before_retained_dependent_is_a_conflict() {
        let (reconciler, _, _) = setup(FakeProvider::new().replace_on("az"));
        let volume = |az: &str| ResourceNode::new("volume", "ebs").input("az", az).delete_before_replace();
        let full = DeclarationSet::new().with(volume("us-east-1a")).with(
            ResourceNode::new("snapshot", "ebs:snapshot")
                .input("volume", Input::output("volume", "id"))
                .protected(),
        );
        reconciler.reconcile(&full).unwrap();

        let preview = reconciler
            .preview(&DeclarationSet::new().with(volume("us-east-1b")))
            .unwrap();

        assert_eq!(
            preview.action("volume"),
            Some(&PlannedAction::Conflict {
                reason: "cannot replace before dependent 'snapshot' is deleted".into()
            })
        );
        assert!(matches!(preview.action("snapshot"), Some(PlannedAction::Retain { .. })));
    }

    #[test]
    fn test_removals_planned_dependents_first() {
        let (reconciler, provider, _) = setup(FakeProvider::new());
        let full = DeclarationSet::new()
            .with(ResourceNode::new("key", "kms").protected())
            .with(ResourceNode::new("bucket", "s3").input("kmsKey", Input::output("key", "id")))
            .with(ResourceNode::new("policy", "s3:policy").input("bucket", Input::output("bucket", "id")));
        reconciler.reconcile(&full).unwrap();
        provider.clear_calls();

        let preview = reconciler.preview(&DeclarationSet::new()).unwrap();

        let order: Vec<&str> = preview.deletions.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(order, vec!["policy", "bucket", "key"]);
        assert_eq!(preview.action("policy"), Some(&PlannedAction::Delete));
        assert_eq!(
            preview.action("key"),
            Some(&PlannedAction::Retain {
                reason: "protected".into()
            })
        );
        assert_eq!(provider.count(Op::Delete, "policy"), 0);
    }
}
