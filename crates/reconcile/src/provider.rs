//! Provider adapter interface
//!
//! A [`Provider`] turns resolved inputs into a real resource and reports its
//! outputs. Providers are registered by name in a [`ProviderRegistry`]; nodes
//! pick one through [`crate::ResourceNode::provider`].

use crate::context::CancellationToken;
use crate::error::ProviderError;
use crate::record::ProvisionRecord;
use crate::resolve::ResolvedInputs;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-call context handed to providers
#[derive(Debug, Clone, Copy)]
pub struct OperationContext<'a> {
    /// Node the call is made for
    pub node: &'a str,
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Point after which the call should give up with [`ProviderError::Timeout`]
    pub deadline: Option<Instant>,
    pub cancel: &'a CancellationToken,
}

impl OperationContext<'_> {
    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with a timeout error once the deadline has passed
    ///
    /// Providers that poll for readiness call this between polls.
    pub fn check_deadline(&self) -> Result<(), ProviderError> {
        if self.is_expired() {
            return Err(ProviderError::timeout(format!(
                "{}: deadline exceeded on attempt {}",
                self.node, self.attempt
            )));
        }
        Ok(())
    }
}

/// Outputs reported by a successful apply or read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutput {
    pub outputs: BTreeMap<String, Value>,
    /// Output names that must be masked when displayed
    pub secret: BTreeSet<String>,
}

impl ApplyOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    pub fn secret_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        self.secret.insert(name.clone());
        self.outputs.insert(name, value.into());
        self
    }
}

impl From<BTreeMap<String, Value>> for ApplyOutput {
    fn from(outputs: BTreeMap<String, Value>) -> Self {
        Self {
            outputs,
            secret: BTreeSet::new(),
        }
    }
}

/// Adapter for one external system
///
/// Calls run on worker threads and may block. Returning
/// [`ProviderError::Retryable`] or [`ProviderError::Timeout`] lets the engine
/// retry with backoff; [`ProviderError::Fatal`] fails the node immediately.
pub trait Provider: Send + Sync {
    /// Create the resource, or update it in place when `previous` exists
    fn apply(
        &self,
        ctx: &OperationContext<'_>,
        kind: &str,
        inputs: &ResolvedInputs,
        previous: Option<&ProvisionRecord>,
    ) -> Result<ApplyOutput, ProviderError>;

    /// Delete the resource described by `record`
    fn delete(
        &self,
        ctx: &OperationContext<'_>,
        kind: &str,
        record: &ProvisionRecord,
    ) -> Result<(), ProviderError>;

    /// Look up an existing resource that this deployment does not manage
    fn read(
        &self,
        ctx: &OperationContext<'_>,
        kind: &str,
        inputs: &ResolvedInputs,
    ) -> Result<ApplyOutput, ProviderError> {
        let _ = inputs;
        Err(ProviderError::fatal(format!(
            "{}: provider does not support lookups of '{kind}'",
            ctx.node
        )))
    }

    /// Whether moving from `previous` to `inputs` needs delete-then-create
    fn requires_replace(&self, kind: &str, previous: &ProvisionRecord, inputs: &ResolvedInputs) -> bool {
        let _ = (kind, previous, inputs);
        false
    }
}

/// Named provider instances
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    owners: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name`, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> &mut Self {
        let name = name.into();
        self.owners.remove(&name);
        self.providers.insert(name, provider);
        self
    }

    /// Register a provider whose configuration comes from node `owner`
    ///
    /// Every node using the provider implicitly depends on `owner`, e.g.
    /// Kubernetes resources on the cluster they are deployed to.
    pub fn register_scoped(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        owner: impl Into<String>,
    ) -> &mut Self {
        let name = name.into();
        self.owners.insert(name.clone(), owner.into());
        self.providers.insert(name, provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Provider name -> owning node id
    pub fn owners(&self) -> &HashMap<String, String> {
        &self.owners
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .field("owners", &self.owners)
            .finish()
    }
}
