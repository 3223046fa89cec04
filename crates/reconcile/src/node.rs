//! Resource declarations
//!
//! A [`ResourceNode`] is one declared unit of infrastructure. Nodes are plain
//! data: identity, inputs, ordering hints and lifecycle flags. Everything that
//! talks to real infrastructure lives behind [`crate::provider::Provider`].

use crate::value::{DeferredRef, Input};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Provider name used when a node does not pick one
pub const DEFAULT_PROVIDER: &str = "default";

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn is_default_provider(provider: &str) -> bool {
    provider == DEFAULT_PROVIDER
}

/// How the executor treats a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    /// Created, updated and deleted through `apply`/`delete`
    #[default]
    Managed,
    /// Read-only data source, re-read through `read` on every run
    Lookup,
}

/// One declared resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Stable logical name, unique within a deployment
    pub id: String,

    /// Provider-specific type tag, e.g. "aws:ec2/vpc" or "k8s:apps/v1/deployment"
    pub kind: String,

    /// Input properties; values may reference other nodes' outputs
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,

    /// Nodes that must complete first regardless of input references
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,

    /// Never deleted or replaced by the executor
    #[serde(default)]
    pub protect: bool,

    /// Name of the provider instance handling this node
    #[serde(default = "default_provider", skip_serializing_if = "is_default_provider")]
    pub provider: String,

    #[serde(default)]
    pub mode: NodeMode,

    /// Delete the old instance before creating its replacement
    ///
    /// For resources whose identity cannot exist twice, like a fixed name.
    /// By default the replacement is created first and the old instance is
    /// deleted once every dependent has converged onto the new one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete_before_replace: bool,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            inputs: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            protect: false,
            provider: default_provider(),
            mode: NodeMode::Managed,
            delete_before_replace: false,
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn protected(mut self) -> Self {
        self.protect = true;
        self
    }

    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = name.into();
        self
    }

    pub fn lookup(mut self) -> Self {
        self.mode = NodeMode::Lookup;
        self
    }

    pub fn delete_before_replace(mut self) -> Self {
        self.delete_before_replace = true;
        self
    }

    /// Every deferred reference in the inputs, depth-first in property order
    pub fn references(&self) -> Vec<&DeferredRef> {
        self.inputs.values().flat_map(Input::references).collect()
    }

    /// Ids this node depends on, explicit and implied by references
    pub fn dependency_ids(&self) -> BTreeSet<&str> {
        self.depends_on
            .iter()
            .map(String::as_str)
            .chain(self.references().into_iter().map(|r| r.node.as_str()))
            .collect()
    }
}

/// Full set of declarations for one deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclarationSet {
    /// Declared nodes, in declaration order
    #[serde(default, rename = "resource")]
    pub nodes: Vec<ResourceNode>,

    /// Values surfaced to the caller after a run
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, Input>,
}

impl DeclarationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, node: ResourceNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn export(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.exports.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_ids_merge_explicit_and_implied() {
        let node = ResourceNode::new("deployment", "k8s:deployment")
            .input("namespace", Input::output("namespace", "name"))
            .input(
                "volumes",
                Input::list([Input::map([("volumeID", Input::output("volume", "id"))])]),
            )
            .depends_on("service-account")
            .depends_on("volume");

        let deps: Vec<_> = node.dependency_ids().into_iter().collect();
        assert_eq!(deps, vec!["namespace", "service-account", "volume"]);
    }

    #[test]
    fn test_builder_defaults() {
        let node = ResourceNode::new("repo", "aws:ecr/repository");
        assert_eq!(node.provider, DEFAULT_PROVIDER);
        assert_eq!(node.mode, NodeMode::Managed);
        assert!(!node.protect);

        let node = node.protected().provider("aws").lookup();
        assert!(node.protect);
        assert_eq!(node.provider, "aws");
        assert_eq!(node.mode, NodeMode::Lookup);
    }

    #[test]
    fn test_declaration_set_lookup() {
        let set = DeclarationSet::new()
            .with(ResourceNode::new("vpc", "aws:ec2/vpc"))
            .with(ResourceNode::new("cluster", "aws:eks/cluster"))
            .export("kubeconfig", Input::output("cluster", "kubeconfig"));

        assert_eq!(set.len(), 2);
        assert!(set.contains("cluster"));
        assert!(!set.contains("dns"));
        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["vpc", "cluster"]);
        assert_eq!(set.exports.len(), 1);
    }

    #[test]
    fn test_deserialize_node_from_json() {
        let node: ResourceNode = serde_json::from_str(
            r#"{
                "id": "ci-record",
                "kind": "cloudflare:record",
                "provider": "cloudflare",
                "inputs": {
                    "type": "CNAME",
                    "value": { "$ref": "jenkins-service", "output": "hostname" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(node.provider, "cloudflare");
        assert!(node.depends_on.is_empty());
        assert_eq!(node.references().len(), 1);
        assert_eq!(node.references()[0].node, "jenkins-service");
    }
}
