use crate::config::Config;
use crate::declaration;
use crate::state_file::FileStateStore;
use anyhow::{Context, Result};
use reconcile::{
    CancellationToken, DeclarationSet, DeploymentRun, NodeOutcome, NodeReport, NoObserver,
    Preview, ProviderRegistry, Reconciler, RunObserver, RunSummary, StateStore,
};
use std::path::Path;
use std::sync::Arc;

/// A named deployment backed by a state file
///
/// Wires the configuration, the registered providers and the stack's
/// [`FileStateStore`] into reconciler runs.
pub struct Stack {
    config: Config,
    providers: Arc<ProviderRegistry>,
    store: Arc<FileStateStore>,
    cancel: CancellationToken,
    observer: Arc<dyn RunObserver>,
}

impl Stack {
    /// Open the stack named by `config.stack`, loading its state file
    pub fn open(config: Config, providers: ProviderRegistry) -> Result<Self> {
        config.validate()?;
        let path = config.state_file()?;
        let store = FileStateStore::open(&path)
            .with_context(|| format!("Failed to open state for stack '{}'", config.stack))?;
        log::debug!(
            "Opened stack '{}' ({} records, providers: {})",
            config.stack,
            store.len(),
            providers.names().join(", ")
        );

        Ok(Self {
            config,
            providers: Arc::new(providers),
            store: Arc::new(store),
            cancel: CancellationToken::new(),
            observer: Arc::new(NoObserver),
        })
    }

    /// Report progress of every run to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.stack
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state_path(&self) -> &Path {
        self.store.path()
    }

    /// Token that stops the current and every later run of this stack
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn reconciler(&self) -> Reconciler {
        let store: Arc<dyn StateStore> = self.store.clone();
        let run = DeploymentRun::new(&self.config.stack, store, Arc::clone(&self.providers))
            .with_options(self.config.run_options())
            .with_cancellation(self.cancel.clone())
            .with_observer(Arc::clone(&self.observer));
        Reconciler::new(run)
    }

    /// Converge the stack to `declarations`
    pub fn up(&self, declarations: &DeclarationSet) -> Result<RunSummary> {
        log::info!(
            "Converging stack '{}' ({} resources)",
            self.config.stack,
            declarations.len()
        );
        let summary = self
            .reconciler()
            .reconcile(declarations)
            .with_context(|| format!("Failed to converge stack '{}'", self.config.stack))?;
        log_result(&summary);
        Ok(summary)
    }

    /// Load a declaration file and converge the stack to it
    pub fn up_file(&self, path: &Path) -> Result<RunSummary> {
        let declarations = declaration::load(path, self.config.expand_env)?;
        self.up(&declarations)
    }

    /// Plan a run without calling any provider
    pub fn preview(&self, declarations: &DeclarationSet) -> Result<Preview> {
        self.reconciler()
            .preview(declarations)
            .with_context(|| format!("Failed to preview stack '{}'", self.config.stack))
    }

    pub fn preview_file(&self, path: &Path) -> Result<Preview> {
        let declarations = declaration::load(path, self.config.expand_env)?;
        self.preview(&declarations)
    }

    /// Delete every resource of the stack except protected ones
    pub fn destroy(&self) -> Result<RunSummary> {
        log::info!("Destroying stack '{}'", self.config.stack);
        let summary = self
            .reconciler()
            .destroy()
            .with_context(|| format!("Failed to destroy stack '{}'", self.config.stack))?;
        log_result(&summary);
        Ok(summary)
    }

    /// Recorded outputs of every ready resource, ordered by id
    pub fn outputs(&self) -> Result<Vec<NodeReport>> {
        let records = self
            .store
            .list_all()
            .with_context(|| format!("Failed to read state for stack '{}'", self.config.stack))?;
        Ok(records
            .into_iter()
            .filter(|record| record.is_ready())
            .map(|record| {
                let mut report = NodeReport::new(record.id, record.kind, NodeOutcome::Unchanged);
                report.outputs = record.outputs;
                report.secret_outputs = record.secret_outputs;
                report
            })
            .collect())
    }
}

fn log_result(summary: &RunSummary) {
    let counts = summary.counts();
    if summary.is_success() {
        log::info!(
            "Stack '{}' converged: {} changes in {}ms",
            summary.deployment,
            counts.total_changes(),
            summary.duration().num_milliseconds()
        );
    } else {
        log::warn!(
            "Stack '{}' finished with {} failed and {} cancelled resources",
            summary.deployment,
            counts.failed,
            counts.cancelled
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use reconcile::{
        ApplyOutput, ExportValue, OperationContext, PlannedAction, Provider, ProviderError,
        ProvisionRecord, ResolvedInputs,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const CI_STACK: &str = include_str!("../fixtures/ci_stack.toml");

    /// Provider that fabricates plausible outputs and records mutations
    #[derive(Default)]
    struct CloudProvider {
        applies: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
    }

    impl CloudProvider {
        fn applies(&self) -> Vec<String> {
            self.applies.lock().unwrap().clone()
        }

        fn deletes(&self) -> Vec<String> {
            self.deletes.lock().unwrap().clone()
        }
    }

    impl Provider for CloudProvider {
        fn apply(
            &self,
            ctx: &OperationContext<'_>,
            kind: &str,
            inputs: &ResolvedInputs,
            _previous: Option<&ProvisionRecord>,
        ) -> Result<ApplyOutput, ProviderError> {
            self.applies.lock().unwrap().push(ctx.node.to_string());
            let mut output = ApplyOutput::new().output("id", format!("{}-id", ctx.node));
            if let Some(name) = inputs.get("name") {
                output = output.output("name", name.clone());
            }
            if kind.ends_with(":Service") {
                output = output.output(
                    "status",
                    json!({ "loadBalancer": { "ingress": [
                        { "hostname": format!("lb-{}.elb.amazonaws.com", ctx.node) }
                    ] } }),
                );
            }
            if kind == "cloudflare:Record" {
                let name = inputs.get("name").and_then(|v| v.as_str()).unwrap_or("@");
                output = output.output("hostname", format!("{name}.example.com"));
            }
            Ok(output)
        }

        fn delete(
            &self,
            ctx: &OperationContext<'_>,
            _kind: &str,
            _record: &ProvisionRecord,
        ) -> Result<(), ProviderError> {
            self.deletes.lock().unwrap().push(ctx.node.to_string());
            Ok(())
        }

        fn read(
            &self,
            _ctx: &OperationContext<'_>,
            kind: &str,
            inputs: &ResolvedInputs,
        ) -> Result<ApplyOutput, ProviderError> {
            if kind != "cloudflare:Zone" {
                return Err(ProviderError::fatal(format!("cannot look up '{kind}'")));
            }
            Ok(ApplyOutput::new()
                .output("id", "zone-123")
                .output("name", inputs.get("name").cloned().unwrap_or_default()))
        }
    }

    struct Fixture {
        dir: TempDir,
        config: Config,
        cloud: Arc<CloudProvider>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = Config {
                stack: "ci".into(),
                state_dir: Some(dir.path().to_string_lossy().into_owned()),
                jobs: 3,
                retry: RetrySettings {
                    base_delay_ms: 1,
                    max_delay_ms: 5,
                    ..RetrySettings::default()
                },
                ..Config::default()
            };
            Self {
                dir,
                config,
                cloud: Arc::new(CloudProvider::default()),
            }
        }

        fn stack(&self) -> Stack {
            let mut providers = ProviderRegistry::new();
            providers.register("default", self.cloud.clone());
            providers.register("cloudflare", self.cloud.clone());
            providers.register_scoped("k8s", self.cloud.clone(), "cluster");
            Stack::open(self.config.clone(), providers).unwrap()
        }
    }

    fn declarations() -> DeclarationSet {
        declaration::parse(CI_STACK, declaration::Format::Toml).unwrap()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn test_up_converges_ci_stack() {
        let fixture = Fixture::new();
        let stack = fixture.stack();

        let summary = stack.up(&declarations()).unwrap();

        assert!(summary.is_success(), "{:?}", summary.failures());
        assert_eq!(summary.counts().created, 7);
        assert_eq!(summary.counts().read, 1);
        assert_eq!(summary.export("url"), Some(&json!("https://ci.example.com")));
        assert_eq!(
            summary.export("loadBalancer"),
            Some(&json!("lb-service.elb.amazonaws.com"))
        );

        let applies = fixture.cloud.applies();
        assert_eq!(applies.len(), 7);
        assert!(position(&applies, "vpc") < position(&applies, "cluster"));
        assert!(position(&applies, "cluster") < position(&applies, "namespace"));
        assert!(position(&applies, "volume") < position(&applies, "deployment"));
        assert!(position(&applies, "deployment") < position(&applies, "service"));
        assert!(position(&applies, "service") < position(&applies, "dns"));

        let dns = stack.store.get("dns").unwrap().unwrap();
        assert_eq!(dns.inputs["value"], "lb-service.elb.amazonaws.com");
        assert_eq!(dns.inputs["zoneId"], "zone-123");
    }

    #[test]
    fn test_state_survives_reopen() {
        let fixture = Fixture::new();
        fixture.stack().up(&declarations()).unwrap();
        assert!(fixture.config.state_file().unwrap().exists());

        let reopened = fixture.stack();
        let preview = reopened.preview(&declarations()).unwrap();
        assert!(!preview.summary().has_changes());

        let summary = reopened.up(&declarations()).unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.counts().total_changes(), 0);
        assert_eq!(fixture.cloud.applies().len(), 7);
    }

    #[test]
    fn test_up_file_and_preview_file() {
        let fixture = Fixture::new();
        let path = fixture.dir.path().join("ci_stack.toml");
        std::fs::write(&path, CI_STACK).unwrap();
        let stack = fixture.stack();

        let preview = stack.preview_file(&path).unwrap();
        assert_eq!(preview.action("vpc"), Some(&PlannedAction::Create));
        assert_eq!(preview.action("zone"), Some(&PlannedAction::Read));

        let summary = stack.up_file(&path).unwrap();
        assert!(summary.is_success());
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let fixture = Fixture::new();
        let stack = fixture.stack();
        stack.up(&declarations()).unwrap();

        let mut trimmed = declarations();
        trimmed.nodes.retain(|n| n.id != "dns");
        trimmed.exports.remove("url");
        let summary = stack.up(&trimmed).unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.outcome("dns"), Some(&NodeOutcome::Deleted));
        assert_eq!(fixture.cloud.deletes(), vec!["dns"]);
        assert!(stack.store.get("dns").unwrap().is_none());
    }

    #[test]
    fn test_destroy_keeps_protected_volume() {
        let fixture = Fixture::new();
        let stack = fixture.stack();
        stack.up(&declarations()).unwrap();

        let summary = stack.destroy().unwrap();

        assert!(matches!(
            summary.outcome("volume"),
            Some(NodeOutcome::Retained { .. })
        ));
        let deletes = fixture.cloud.deletes();
        assert!(!deletes.contains(&"volume".to_string()));
        assert!(position(&deletes, "dns") < position(&deletes, "service"));
        assert!(position(&deletes, "deployment") < position(&deletes, "namespace"));
        assert!(position(&deletes, "namespace") < position(&deletes, "cluster"));
        assert!(position(&deletes, "cluster") < position(&deletes, "vpc"));

        let remaining: Vec<_> = stack.outputs().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec!["volume"]);
    }

    #[test]
    fn test_outputs_carry_secret_markers() {
        let fixture = Fixture::new();
        let stack = fixture.stack();
        let declarations = DeclarationSet::new()
            .with(reconcile::ResourceNode::new("vpc", "aws:ec2/Vpc"))
            .export("vpc", reconcile::Input::output("vpc", "id"));
        stack.up(&declarations).unwrap();

        let outputs = stack.outputs().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].outputs["id"], "vpc-id");
        assert!(!outputs[0].is_secret("id"));
    }

    #[test]
    fn test_cancelled_stack_starts_nothing() {
        let fixture = Fixture::new();
        let stack = fixture.stack();
        stack.cancellation_token().cancel();

        let summary = stack.up(&declarations()).unwrap();

        assert!(!summary.is_success());
        assert!(fixture.cloud.applies().is_empty());
        assert!(matches!(
            summary.exports.get("url"),
            Some(ExportValue::Unavailable { .. })
        ));
    }

    #[test]
    fn test_validation_error_is_reported() {
        let fixture = Fixture::new();
        let stack = fixture.stack();
        let declarations = DeclarationSet::new().with(
            reconcile::ResourceNode::new("dns", "cloudflare:Record")
                .input("value", reconcile::Input::output("service", "hostname")),
        );

        let err = stack.up(&declarations).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Failed to converge stack 'ci'"));
        assert!(message.contains("unknown node 'service'"));
        assert!(fixture.cloud.applies().is_empty());
    }
}
