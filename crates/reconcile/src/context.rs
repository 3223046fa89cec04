//! Run context and callback traits
//!
//! A [`DeploymentRun`] carries everything one reconciliation needs: the state
//! store, the provider registry, options, a cancellation token and an
//! observer. It is passed explicitly; there is no process-wide state.

use crate::error::ProviderError;
use crate::outcome::NodeOutcome;
use crate::provider::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::store::StateStore;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Run-level cancellation signal
///
/// Cancelling stops the scheduler from starting new nodes and interrupts retry
/// backoff. In-flight provider calls see the flag through
/// [`crate::provider::OperationContext`] and may stop cooperatively.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        let mut cancelled = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        match flag.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep for `timeout` or until cancelled; returns whether cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let guard = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match signal.wait_timeout_while(guard, timeout, |cancelled| !*cancelled) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

/// Observer for run progress
///
/// Called from worker threads, so implementations must be `Sync`.
pub trait RunObserver: Send + Sync {
    /// A provider operation ("apply", "read", "delete") is starting
    fn on_node_start(&self, id: &str, operation: &str);

    /// An attempt failed and will be retried after `delay`
    fn on_retry(&self, id: &str, attempt: u32, max_attempts: u32, error: &ProviderError, delay: Duration);

    /// A node reached its terminal outcome for this run
    fn on_node_complete(&self, id: &str, outcome: &NodeOutcome);
}

/// Observer that ignores everything
pub struct NoObserver;

impl RunObserver for NoObserver {
    fn on_node_start(&self, _id: &str, _operation: &str) {}
    fn on_retry(&self, _id: &str, _attempt: u32, _max: u32, _error: &ProviderError, _delay: Duration) {}
    fn on_node_complete(&self, _id: &str, _outcome: &NodeOutcome) {}
}

/// Options for a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum provider operations in flight at once
    pub max_concurrency: usize,
    /// Retry policy for retryable provider errors
    pub retry: RetryPolicy,
    /// Deadline handed to each provider call
    pub operation_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            operation_timeout: Some(Duration::from_secs(20 * 60)),
        }
    }
}

/// Explicit context for one deployment run
#[derive(Clone)]
pub struct DeploymentRun {
    /// Deployment (stack) name, used in logs and summaries
    pub name: String,
    pub store: Arc<dyn StateStore>,
    pub providers: Arc<ProviderRegistry>,
    pub options: RunOptions,
    pub cancel: CancellationToken,
    pub observer: Arc<dyn RunObserver>,
}

impl DeploymentRun {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn StateStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            providers,
            options: RunOptions::default(),
            cancel: CancellationToken::new(),
            observer: Arc::new(NoObserver),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }
}
