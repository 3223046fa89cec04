//! Execution engine - converges declarations with bounded parallelism
//!
//! A run has five phases:
//! 1. validation: graph, providers, exports and the deletion graph are checked
//!    before any provider is called
//! 2. deletion pass: recorded nodes that are no longer declared, dependents first
//! 3. apply pass: declared nodes in dependency order, see [`Reconciler::reconcile`]
//! 4. cleanup: instances replaced in this or an earlier run are deleted once
//!    every dependent of their node has converged
//! 5. exports are resolved against the final state

use crate::context::DeploymentRun;
use crate::error::{Error, FailureCause, NodeFailure, ProviderError, Result};
use crate::graph::{Dag, GraphBuilder};
use crate::node::{DeclarationSet, NodeMode, ResourceNode};
use crate::outcome::{ExportValue, NodeOutcome, NodeReport, RunSummary};
use crate::provider::{ApplyOutput, OperationContext, Provider};
use crate::record::{InputHash, ProvisionRecord, RecordStatus};
use crate::resolve::{ResolvedInputs, Resolver, hash_inputs};
use crate::retry::{RetryError, with_retry};
use crate::scheduler::{Settle, Visit, Walker};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

impl Settle for NodeOutcome {
    fn unblocks_dependents(&self) -> bool {
        self.is_ready() || *self == Self::Deleted
    }

    fn panicked(node: &str, message: String) -> Self {
        Self::failed(node, FailureCause::Panicked { message })
    }
}

/// Validated input to a run
pub(crate) struct Validated {
    pub dag: Dag,
    /// Records whose node is no longer declared
    pub removed: Vec<ProvisionRecord>,
    pub removal_dag: Dag,
}

/// Drives one deployment towards its declarations
pub struct Reconciler {
    run: DeploymentRun,
}

impl Reconciler {
    pub fn new(run: DeploymentRun) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &DeploymentRun {
        &self.run
    }

    /// Converge the deployment to `declarations`
    ///
    /// Returns `Err` only for validation and infrastructure errors, which are
    /// raised before any provider is invoked. Per-node failures are reported
    /// in the summary: a failed node blocks its dependents while unrelated
    /// branches continue.
    pub fn reconcile(&self, declarations: &DeclarationSet) -> Result<RunSummary> {
        let started_at = Utc::now();
        let plan = self.validate(declarations)?;
        log::info!(
            "{}: reconciling {} nodes, {} to remove",
            self.run.name,
            plan.dag.len(),
            plan.removed.len()
        );

        let deletions = self.deletion_pass(&plan.removed, &plan.removal_dag)?;
        let held = held_dependencies(&plan.removed, &deletions);
        let nodes = self.apply_pass(declarations, &plan.dag, &held)?;
        self.cleanup_pass(&plan.dag, &nodes, &held)?;
        let exports = self.resolve_exports(declarations);

        let summary = RunSummary {
            deployment: self.run.name.clone(),
            nodes,
            deletions,
            exports,
            cancelled: self.run.cancel.is_cancelled(),
            started_at,
            finished_at: Utc::now(),
        };
        let counts = summary.counts();
        log::info!(
            "{}: {} changes, {} unchanged, {} failed",
            self.run.name,
            counts.total_changes(),
            counts.unchanged + counts.read,
            counts.failed
        );
        Ok(summary)
    }

    /// Delete every unprotected recorded resource
    pub fn destroy(&self) -> Result<RunSummary> {
        self.reconcile(&DeclarationSet::new())
    }

    pub(crate) fn validate(&self, declarations: &DeclarationSet) -> Result<Validated> {
        let providers = &self.run.providers;
        let dag = GraphBuilder::new(&declarations.nodes)
            .with_provider_owners(providers.owners().clone())
            .build()?;

        for node in &declarations.nodes {
            if !providers.contains(&node.provider) {
                return Err(Error::UnknownProvider {
                    node: node.id.clone(),
                    provider: node.provider.clone(),
                });
            }
        }

        for (name, input) in &declarations.exports {
            if let Some(reference) = input.references().into_iter().find(|r| !dag.contains(&r.node)) {
                return Err(Error::UnknownReference {
                    node: format!("export '{name}'"),
                    target: reference.node.clone(),
                });
            }
        }

        let removed: Vec<ProvisionRecord> = self
            .run
            .store
            .list_all()?
            .into_iter()
            .filter(|record| !dag.contains(&record.id))
            .collect();
        for record in removed.iter().filter(|record| !record.protect) {
            let own = (record.mode == NodeMode::Managed && !record.never_created()).then_some(record);
            let missing = own
                .into_iter()
                .chain(&record.superseded)
                .find(|instance| !providers.contains(&instance.provider));
            if let Some(instance) = missing {
                return Err(Error::UnknownProvider {
                    node: record.id.clone(),
                    provider: instance.provider.clone(),
                });
            }
        }
        let removal_dag = Dag::from_records(&removed)?;

        Ok(Validated {
            dag,
            removed,
            removal_dag,
        })
    }

    fn apply_pass(
        &self,
        declarations: &DeclarationSet,
        dag: &Dag,
        held: &HashMap<String, String>,
    ) -> Result<Vec<NodeReport>> {
        let by_id: HashMap<&str, &ResourceNode> = declarations
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), node))
            .collect();

        let visits = Walker::new(dag, self.run.options.max_concurrency, &self.run.cancel).run(|id| {
            let node = by_id[id];
            let dependencies: BTreeSet<String> = dag
                .dependencies_of(id)
                .into_iter()
                .map(str::to_string)
                .collect();
            let outcome = match self.converge(node, &dependencies, held) {
                Ok(outcome) => outcome,
                Err(failure) => NodeOutcome::Failed { failure },
            };
            self.finish(id, &outcome);
            outcome
        })?;

        let mut outcomes: HashMap<&str, NodeOutcome> = HashMap::new();
        for (index, visit) in visits.into_iter().enumerate() {
            let id = dag.id(index);
            let outcome = match visit {
                Visit::Completed(outcome) => outcome,
                Visit::Blocked { upstream } => {
                    let outcome = NodeOutcome::failed(id, FailureCause::Dependency { upstream });
                    self.finish(id, &outcome);
                    outcome
                }
                Visit::NotStarted => {
                    self.finish(id, &NodeOutcome::Cancelled);
                    NodeOutcome::Cancelled
                }
            };
            outcomes.insert(id, outcome);
        }

        declarations
            .nodes
            .iter()
            .map(|node| {
                let outcome = outcomes
                    .remove(node.id.as_str())
                    .unwrap_or(NodeOutcome::Cancelled);
                self.report(&node.id, &node.kind, outcome)
            })
            .collect()
    }

    fn deletion_pass(&self, removed: &[ProvisionRecord], removal_dag: &Dag) -> Result<Vec<NodeReport>> {
        if removed.is_empty() {
            return Ok(Vec::new());
        }
        let by_id: HashMap<&str, &ProvisionRecord> =
            removed.iter().map(|record| (record.id.as_str(), record)).collect();
        // Dependents are deleted before the nodes they depend on
        let order = removal_dag.reversed();

        let visits = Walker::new(&order, self.run.options.max_concurrency, &self.run.cancel).run(|id| {
            let outcome = self.retire(by_id[id]);
            self.finish(id, &outcome);
            outcome
        })?;

        let mut reports = Vec::with_capacity(removed.len());
        let topological = order.topological_order()?;
        let mut visits: HashMap<&str, Visit<NodeOutcome>> = order
            .ids()
            .iter()
            .map(String::as_str)
            .zip(visits)
            .collect();
        for id in &topological {
            let record = by_id[id.as_str()];
            let outcome = match visits.remove(id.as_str()) {
                Some(Visit::Completed(outcome)) => outcome,
                Some(Visit::Blocked { upstream }) => {
                    let outcome = NodeOutcome::Retained {
                        reason: format!("dependent '{upstream}' was not deleted"),
                    };
                    self.finish(id, &outcome);
                    outcome
                }
                Some(Visit::NotStarted) | None => {
                    self.finish(id, &NodeOutcome::Cancelled);
                    NodeOutcome::Cancelled
                }
            };
            reports.push(self.report(&record.id, &record.kind, outcome)?);
        }
        Ok(reports)
    }

    /// Delete replaced instances whose node and dependents have all converged
    ///
    /// Runs dependents first. An instance that cannot be deleted stays in the
    /// record and is retried by the next run.
    fn cleanup_pass(&self, dag: &Dag, reports: &[NodeReport], held: &HashMap<String, String>) -> Result<()> {
        let ready: HashSet<&str> = reports
            .iter()
            .filter(|report| report.outcome.is_ready())
            .map(|report| report.id.as_str())
            .collect();

        for id in dag.reversed().topological_order()? {
            if self.run.cancel.is_cancelled() {
                break;
            }
            let Some(record) = self.run.store.get(&id)? else {
                continue;
            };
            if record.superseded.is_empty() {
                continue;
            }
            if let Some(dependent) = held.get(&id) {
                log::warn!("{id}: keeping replaced instance, removed '{dependent}' still depends on it");
                continue;
            }
            let waiting = std::iter::once(id.as_str())
                .chain(dag.transitive_dependents(&id))
                .find(|node| !ready.contains(node));
            if let Some(waiting) = waiting {
                log::warn!("{id}: keeping replaced instance until '{waiting}' converges");
                continue;
            }
            if let Err(failure) = self.delete_superseded(&id, &record.superseded) {
                log::error!("{id}: could not delete replaced instance: {}", failure.cause);
            }
        }
        Ok(())
    }

    fn finish(&self, id: &str, outcome: &NodeOutcome) {
        match outcome {
            NodeOutcome::Failed { failure } => log::error!("{id}: {}", failure.cause),
            NodeOutcome::Unchanged => log::debug!("{id}: unchanged"),
            other => log::info!("{id}: {other}"),
        }
        self.run.observer.on_node_complete(id, outcome);
    }

    fn report(&self, id: &str, kind: &str, outcome: NodeOutcome) -> Result<NodeReport> {
        let mut report = NodeReport::new(id, kind, outcome);
        let keeps_outputs = report.outcome.is_ready()
            || matches!(report.outcome, NodeOutcome::Retained { .. });
        if keeps_outputs && let Some(record) = self.run.store.get(id)? {
            report.outputs = record.outputs;
            report.secret_outputs = record.secret_outputs;
        }
        Ok(report)
    }

    /// Bring one declared node to `ready`
    fn converge(
        &self,
        node: &ResourceNode,
        dependencies: &BTreeSet<String>,
        held: &HashMap<String, String>,
    ) -> std::result::Result<NodeOutcome, NodeFailure> {
        let fail = |cause: FailureCause| NodeFailure::new(&node.id, cause);
        let store = self.run.store.as_ref();
        let provider = self.provider(&node.id, &node.provider).map_err(fail)?;

        let previous = store.get(&node.id).map_err(|error| fail(FailureCause::Store { error }))?;
        let inputs = Resolver::new(store).resolve(node).map_err(|error| {
            if matches!(error, Error::NotReady { .. }) {
                log::error!("{}: resolved before its dependencies were ready", node.id);
            }
            fail(FailureCause::Resolution { error })
        })?;
        let hash = hash_inputs(&node.kind, &inputs);

        if node.mode == NodeMode::Lookup {
            return self.read(node, provider.as_ref(), inputs, hash, dependencies, previous.as_ref());
        }

        if let Some(record) = &previous
            && record.is_current(&node.kind, &hash)
        {
            log::debug!("{}: inputs unchanged ({})", node.id, hash.short());
            self.refresh_metadata(node, record, dependencies).map_err(fail)?;
            return Ok(NodeOutcome::Unchanged);
        }

        let mut previous = previous;
        let mut replaced = false;
        if let Some(record) = &previous
            && record.was_provisioned()
            && (record.kind != node.kind || provider.requires_replace(&node.kind, record, &inputs))
        {
            if node.protect || record.protect {
                log::warn!("{}: refusing to replace protected resource", node.id);
                return Err(fail(FailureCause::ProtectedReplace));
            }
            if node.delete_before_replace {
                if let Some(dependent) = held.get(&node.id) {
                    log::warn!("{}: removed '{dependent}' still uses the current instance", node.id);
                    return Err(fail(FailureCause::DependentRetained {
                        dependent: dependent.clone(),
                    }));
                }
                log::info!("{}: deleting before replacement", node.id);
                self.set_status(&node.id, RecordStatus::Deleting).map_err(fail)?;
                self.run.observer.on_node_start(&node.id, "delete");
                self.destroy_instance(&node.id, record)
                    .map_err(|failure| self.record_failure(failure))?;
            } else {
                log::info!("{}: replacing, current instance kept until dependents converge", node.id);
            }
            self.supersede(node, dependencies, !node.delete_before_replace)
                .map_err(fail)?;
            previous = None;
            replaced = true;
        }

        let created = previous.as_ref().is_none_or(|record| !record.was_provisioned());
        self.begin(node, dependencies).map_err(fail)?;
        self.run.observer.on_node_start(&node.id, "apply");

        let result = self.call_with_retry(&node.id, |ctx| {
            provider.apply(ctx, &node.kind, &inputs, previous.as_ref())
        });
        match result {
            Ok(output) => {
                self.commit(node, hash, &inputs, &output, dependencies)
                    .map_err(fail)?;
                Ok(if replaced {
                    NodeOutcome::Replaced
                } else if created {
                    NodeOutcome::Created
                } else {
                    NodeOutcome::Updated
                })
            }
            Err(err) => Err(self.record_failure(retry_failure(&node.id, err))),
        }
    }

    /// Re-read a lookup node
    ///
    /// Lookup records are rewritten whenever the provider reports different
    /// outputs, even if the inputs did not change.
    fn read(
        &self,
        node: &ResourceNode,
        provider: &dyn Provider,
        inputs: ResolvedInputs,
        hash: InputHash,
        dependencies: &BTreeSet<String>,
        previous: Option<&ProvisionRecord>,
    ) -> std::result::Result<NodeOutcome, NodeFailure> {
        let fail = |cause: FailureCause| NodeFailure::new(&node.id, cause);
        self.run.observer.on_node_start(&node.id, "read");
        let output = self
            .call_with_retry(&node.id, |ctx| provider.read(ctx, &node.kind, &inputs))
            .map_err(|err| self.record_failure(retry_failure(&node.id, err)))?;

        let unchanged = previous.is_some_and(|record| {
            record.is_current(&node.kind, &hash)
                && record.outputs == output.outputs
                && record.secret_outputs == output.secret
        });
        if unchanged {
            if let Some(record) = previous {
                self.refresh_metadata(node, record, dependencies).map_err(fail)?;
            }
        } else {
            self.commit(node, hash, &inputs, &output, dependencies)
                .map_err(fail)?;
        }
        Ok(NodeOutcome::Read)
    }

    /// Delete or drop a record in the deletion pass
    fn retire(&self, record: &ProvisionRecord) -> NodeOutcome {
        if record.protect {
            return NodeOutcome::Retained {
                reason: "protected".to_string(),
            };
        }
        if let Err(failure) = self.delete_superseded(&record.id, &record.superseded) {
            return NodeOutcome::Failed { failure };
        }
        if record.mode == NodeMode::Lookup || record.never_created() {
            log::debug!("{}: nothing to delete, dropping record", record.id);
            return match self.run.store.remove(&record.id) {
                Ok(_) => NodeOutcome::Deleted,
                Err(error) => NodeOutcome::failed(&record.id, FailureCause::Store { error }),
            };
        }
        match self.delete_record(record) {
            Ok(()) => NodeOutcome::Deleted,
            Err(failure) => NodeOutcome::Failed { failure },
        }
    }

    fn delete_record(&self, record: &ProvisionRecord) -> std::result::Result<(), NodeFailure> {
        let fail = |cause: FailureCause| NodeFailure::new(&record.id, cause);
        self.set_status(&record.id, RecordStatus::Deleting).map_err(fail)?;
        self.run.observer.on_node_start(&record.id, "delete");
        self.destroy_instance(&record.id, record)
            .map_err(|failure| self.record_failure(failure))?;
        self.run
            .store
            .remove(&record.id)
            .map_err(|error| fail(FailureCause::Store { error }))?;
        Ok(())
    }

    /// Delete one provisioned instance through the provider it was created with
    fn destroy_instance(&self, id: &str, instance: &ProvisionRecord) -> std::result::Result<(), NodeFailure> {
        let provider = self
            .provider(id, &instance.provider)
            .map_err(|cause| NodeFailure::new(id, cause))?;
        self.call_with_retry(id, |ctx| provider.delete(ctx, &instance.kind, instance))
            .map_err(|err| retry_failure(id, err))
    }

    /// Delete replaced instances of `id`, dropping each from the record once gone
    fn delete_superseded(&self, id: &str, instances: &[ProvisionRecord]) -> std::result::Result<(), NodeFailure> {
        let fail = |cause: FailureCause| NodeFailure::new(id, cause);
        for instance in instances {
            log::info!("{id}: deleting replaced instance");
            let result = self.destroy_instance(id, instance);
            let error = result.as_ref().err().map(|failure| failure.cause.to_string());
            self.run
                .store
                .update(id, &mut |current| {
                    current.map(|mut record| {
                        if let Some(index) = record.superseded.iter().position(|old| old == instance) {
                            match &error {
                                None => {
                                    record.superseded.remove(index);
                                }
                                Some(message) => record.superseded[index].mark_failed(message.clone()),
                            }
                        }
                        record
                    })
                })
                .map_err(|error| fail(FailureCause::Store { error }))?;
            result?;
        }
        Ok(())
    }

    fn call_with_retry<T>(
        &self,
        id: &str,
        mut call: impl FnMut(&OperationContext<'_>) -> std::result::Result<T, ProviderError>,
    ) -> std::result::Result<T, RetryError> {
        let options = &self.run.options;
        let cancel = &self.run.cancel;
        with_retry(
            &options.retry,
            cancel,
            |attempt, max_attempts, error, delay| {
                log::warn!("{id}: attempt {attempt}/{max_attempts} failed: {error}; retrying in {delay:?}");
                self.run
                    .observer
                    .on_retry(id, attempt, max_attempts, error, delay);
            },
            |attempt| {
                let ctx = OperationContext {
                    node: id,
                    attempt,
                    deadline: options.operation_timeout.map(|timeout| Instant::now() + timeout),
                    cancel,
                };
                call(&ctx)
            },
        )
    }

    fn provider(&self, id: &str, name: &str) -> std::result::Result<Arc<dyn Provider>, FailureCause> {
        self.run
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| FailureCause::Resolution {
                error: Error::UnknownProvider {
                    node: id.to_string(),
                    provider: name.to_string(),
                },
            })
    }

    /// Mark the record failed, keeping its previous outputs
    fn record_failure(&self, failure: NodeFailure) -> NodeFailure {
        let message = failure.cause.to_string();
        let stored = self.run.store.update(&failure.node, &mut |current| {
            current.map(|mut record| {
                record.mark_failed(message.clone());
                record
            })
        });
        if let Err(error) = stored {
            log::error!("{}: could not record failure: {error}", failure.node);
        }
        failure
    }

    /// Start a replacement record, moving the current instance aside
    ///
    /// With `keep_current` the current instance joins the superseded list for
    /// the cleanup pass; otherwise it has already been deleted.
    fn supersede(
        &self,
        node: &ResourceNode,
        dependencies: &BTreeSet<String>,
        keep_current: bool,
    ) -> std::result::Result<(), FailureCause> {
        self.run
            .store
            .update(&node.id, &mut |current| {
                let mut record = ProvisionRecord::pending(&node.id, &node.kind, &node.provider);
                apply_metadata(&mut record, node, dependencies);
                if let Some(mut old) = current {
                    record.superseded = std::mem::take(&mut old.superseded);
                    if keep_current {
                        record.superseded.push(old);
                    }
                }
                Some(record)
            })
            .map(|_| ())
            .map_err(|error| FailureCause::Store { error })
    }

    /// Write the `creating` record before the first attempt
    fn begin(&self, node: &ResourceNode, dependencies: &BTreeSet<String>) -> std::result::Result<(), FailureCause> {
        self.run
            .store
            .update(&node.id, &mut |current| {
                let mut record = current.unwrap_or_else(|| {
                    ProvisionRecord::pending(&node.id, &node.kind, &node.provider)
                });
                apply_metadata(&mut record, node, dependencies);
                record.mark(RecordStatus::Creating);
                Some(record)
            })
            .map(|_| ())
            .map_err(|error| FailureCause::Store { error })
    }

    fn commit(
        &self,
        node: &ResourceNode,
        hash: InputHash,
        inputs: &ResolvedInputs,
        output: &ApplyOutput,
        dependencies: &BTreeSet<String>,
    ) -> std::result::Result<(), FailureCause> {
        self.run
            .store
            .update(&node.id, &mut |current| {
                let mut record = current.unwrap_or_else(|| {
                    ProvisionRecord::pending(&node.id, &node.kind, &node.provider)
                });
                apply_metadata(&mut record, node, dependencies);
                record.capture(
                    hash.clone(),
                    inputs.clone(),
                    output.outputs.clone(),
                    output.secret.clone(),
                );
                Some(record)
            })
            .map(|_| ())
            .map_err(|error| FailureCause::Store { error })
    }

    fn refresh_metadata(
        &self,
        node: &ResourceNode,
        record: &ProvisionRecord,
        dependencies: &BTreeSet<String>,
    ) -> std::result::Result<(), FailureCause> {
        let stale = record.protect != node.protect
            || record.provider != node.provider
            || record.mode != node.mode
            || &record.dependencies != dependencies;
        if !stale {
            return Ok(());
        }
        self.run
            .store
            .update(&node.id, &mut |current| {
                current.map(|mut record| {
                    apply_metadata(&mut record, node, dependencies);
                    record
                })
            })
            .map(|_| ())
            .map_err(|error| FailureCause::Store { error })
    }

    fn set_status(&self, id: &str, status: RecordStatus) -> std::result::Result<(), FailureCause> {
        self.run
            .store
            .update(id, &mut |current| {
                current.map(|mut record| {
                    record.mark(status);
                    record
                })
            })
            .map(|_| ())
            .map_err(|error| FailureCause::Store { error })
    }

    fn resolve_exports(&self, declarations: &DeclarationSet) -> BTreeMap<String, ExportValue> {
        let resolver = Resolver::new(self.run.store.as_ref());
        declarations
            .exports
            .iter()
            .map(|(name, input)| {
                let value = match resolver.resolve_input(name, input) {
                    Ok(value) => ExportValue::Known {
                        value,
                        secret: resolver.touches_secret(input).unwrap_or(true),
                    },
                    Err(err) => ExportValue::Unavailable {
                        reason: err.to_string(),
                    },
                };
                (name.clone(), value)
            })
            .collect()
    }
}

fn retry_failure(id: &str, err: RetryError) -> NodeFailure {
    let attempts = err.attempts();
    NodeFailure::new(id, FailureCause::from(err)).with_attempts(attempts)
}

/// Declared nodes still used by removed records that were not deleted, with
/// one such dependent each
fn held_dependencies(removed: &[ProvisionRecord], deletions: &[NodeReport]) -> HashMap<String, String> {
    let kept: HashSet<&str> = deletions
        .iter()
        .filter(|report| report.outcome != NodeOutcome::Deleted)
        .map(|report| report.id.as_str())
        .collect();
    removed
        .iter()
        .filter(|record| kept.contains(record.id.as_str()))
        .flat_map(|record| {
            record
                .dependencies
                .iter()
                .map(|dependency| (dependency.clone(), record.id.clone()))
        })
        .collect()
}

fn apply_metadata(record: &mut ProvisionRecord, node: &ResourceNode, dependencies: &BTreeSet<String>) {
    record.kind.clone_from(&node.kind);
    record.provider.clone_from(&node.provider);
    record.mode = node.mode;
    record.protect = node.protect;
    record.dependencies.clone_from(dependencies);
}
