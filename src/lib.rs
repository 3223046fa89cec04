//! # converge
//!
//! Declarative infrastructure stacks on top of the [`reconcile`] engine.
//!
//! A stack is a named deployment: a [`Config`], a set of registered
//! providers and a JSON state file. [`Stack::up`] converges the stack to a
//! declaration document, [`Stack::preview`] plans without touching anything
//! and [`Stack::destroy`] removes every unprotected resource.
//!
//! ```ignore
//! let config = converge::Config::load()?;
//! converge::logging::init(1, false);
//!
//! let mut providers = reconcile::ProviderRegistry::new();
//! providers.register("default", Arc::new(AwsProvider::new()));
//! providers.register_scoped("k8s", Arc::new(KubernetesProvider::new()), "cluster");
//!
//! let stack = converge::Stack::open(config, providers)?;
//! let summary = stack.up_file(Path::new("stack.toml"))?;
//! converge::report::print_summary(&summary);
//! ```

pub mod config;
pub mod declaration;
pub mod logging;
pub mod report;
pub mod stack;
pub mod state_file;

pub use config::{Config, RetrySettings};
pub use declaration::Format;
pub use stack::Stack;
pub use state_file::{FileStateStore, StateDocument};
