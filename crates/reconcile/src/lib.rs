//! # Reconcile
//!
//! A resource-graph reconciler.
//!
//! Resources are declared as [`ResourceNode`]s whose inputs may reference
//! outputs of other nodes that do not exist yet. The [`Reconciler`] builds a
//! dependency graph from explicit `depends_on` ids, every [`DeferredRef`] in the
//! inputs and provider scoping. It then converges each node exactly once, in
//! dependency order, with bounded parallelism.
//!
//! ## Core Concepts
//!
//! - **ResourceNode**: one declared resource (`id`, `kind`, inputs, flags)
//! - **Input**: a literal, a deferred output reference, or a structure of both
//! - **Provider**: adapter that applies, reads and deletes real resources
//! - **StateStore**: persistence for [`ProvisionRecord`]s across runs
//! - **DeploymentRun**: explicit run context (store, providers, options,
//!   cancellation, observer)
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{DeclarationSet, DeploymentRun, Input, MemoryStore, ProviderRegistry, Reconciler, ResourceNode};
//! use std::sync::Arc;
//!
//! let declarations = DeclarationSet::new()
//!     .with(ResourceNode::new("service", "k8s:core/v1:Service").provider("k8s"))
//!     .with(
//!         ResourceNode::new("dns", "cloudflare:Record")
//!             .input("type", "CNAME")
//!             .input("value", Input::output("service", "hostname")),
//!     );
//!
//! let mut providers = ProviderRegistry::new();
//! providers.register("k8s", Arc::new(KubernetesProvider::new()));
//! providers.register("default", Arc::new(CloudflareProvider::new()));
//!
//! let run = DeploymentRun::new("ci", Arc::new(MemoryStore::new()), Arc::new(providers));
//! let summary = Reconciler::new(run).reconcile(&declarations)?;
//! assert!(summary.is_success());
//! ```
//!
//! ## Failure Model
//!
//! Validation errors (cycles, unknown references, unregistered providers) are
//! returned as [`Error`] before any provider is called. Everything else is
//! reported per node in the [`RunSummary`]: a failed node blocks its
//! dependents and leaves independent branches running.

pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod node;
pub mod outcome;
pub mod preview;
pub mod provider;
pub mod record;
pub mod resolve;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types at crate root
pub use context::{CancellationToken, DeploymentRun, NoObserver, RunObserver, RunOptions};
pub use error::{Error, FailureCause, NodeFailure, ProviderError, Result};
pub use executor::Reconciler;
pub use graph::{Dag, GraphBuilder};
pub use node::{DEFAULT_PROVIDER, DeclarationSet, NodeMode, ResourceNode};
pub use outcome::{ExportValue, NodeOutcome, NodeReport, OutcomeCounts, RunSummary};
pub use preview::{PlanSummary, PlannedAction, PlannedNode, Preview};
pub use provider::{ApplyOutput, OperationContext, Provider, ProviderRegistry};
pub use record::{InputHash, ProvisionRecord, RecordStatus};
pub use resolve::{ResolvedInputs, Resolver, hash_inputs};
pub use retry::{RetryError, RetryPolicy, with_retry};
pub use store::{MemoryStore, StateStore};
pub use value::{Concat, DeferredRef, Input, OutputPath, PathSegment};
