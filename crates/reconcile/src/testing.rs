//! Scriptable in-memory provider for tests

use crate::error::ProviderError;
use crate::provider::{ApplyOutput, OperationContext, Provider};
use crate::record::ProvisionRecord;
use crate::resolve::ResolvedInputs;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Apply,
    Delete,
    Read,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub node: String,
    pub inputs: ResolvedInputs,
    /// Whether `apply` received a previous record
    pub had_previous: bool,
}

/// Provider that records calls and returns scripted results
///
/// Every successful apply reports `id = "<node>-id"` plus any outputs set with
/// [`FakeProvider::outputs`]. With [`FakeProvider::fresh_ids`] the id is
/// `"<node>-id-<n>"` for the n-th apply of the node, like a cloud API minting
/// a new identity per create.
#[derive(Default)]
pub struct FakeProvider {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<(Op, String), VecDeque<ProviderError>>>,
    permanent: Mutex<HashMap<(Op, String), ProviderError>>,
    outputs: Mutex<HashMap<String, ApplyOutput>>,
    delays: Mutex<HashMap<String, Duration>>,
    replace_on: Mutex<BTreeSet<String>>,
    fresh_ids: bool,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra outputs reported for `node`
    pub fn outputs(self, node: &str, output: ApplyOutput) -> Self {
        self.outputs.lock().unwrap().insert(node.to_string(), output);
        self
    }

    /// Fail the next `times` calls of `op` on `node` with `error`
    pub fn fail_times(self, op: Op, node: &str, times: usize, error: ProviderError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry((op, node.to_string()))
            .or_default()
            .extend(std::iter::repeat_n(error, times));
        self
    }

    /// Fail every call of `op` on `node`
    pub fn fail_always(self, op: Op, node: &str, error: ProviderError) -> Self {
        self.permanent
            .lock()
            .unwrap()
            .insert((op, node.to_string()), error);
        self
    }

    /// Sleep before answering for `node`, then honour the deadline
    pub fn delay(self, node: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(node.to_string(), delay);
        self
    }

    /// Changing input `name` forces a replace
    pub fn replace_on(self, name: &str) -> Self {
        self.replace_on.lock().unwrap().insert(name.to_string());
        self
    }

    /// Number every applied identity
    pub fn fresh_ids(mut self) -> Self {
        self.fresh_ids = true;
        self
    }

    /// Fail the next call of `op` on `node`, for scripting between runs
    pub fn fail_next(&self, op: Op, node: &str, error: ProviderError) {
        self.failures
            .lock()
            .unwrap()
            .entry((op, node.to_string()))
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Nodes passed to `op`, in call order
    pub fn nodes(&self, op: Op) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.node)
            .collect()
    }

    pub fn count(&self, op: Op, node: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.op == op && c.node == node)
            .count()
    }

    /// Highest number of overlapping calls seen
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn enter(&self, ctx: &OperationContext<'_>, op: Op, inputs: &ResolvedInputs, had_previous: bool) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(Call {
            op,
            node: ctx.node.to_string(),
            inputs: inputs.clone(),
            had_previous,
        });
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(ctx.node).copied();
        let result = self.scripted(ctx, op, delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn scripted(&self, ctx: &OperationContext<'_>, op: Op, delay: Option<Duration>) -> Result<(), ProviderError> {
        if let Some(delay) = delay {
            thread::sleep(delay);
            ctx.check_deadline()?;
        }
        let key = (op, ctx.node.to_string());
        if let Some(error) = self.permanent.lock().unwrap().get(&key) {
            return Err(error.clone());
        }
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(())
    }

    fn output_for(&self, node: &str) -> ApplyOutput {
        let id = if self.fresh_ids {
            format!("{node}-id-{}", self.count(Op::Apply, node))
        } else {
            format!("{node}-id")
        };
        let mut output = ApplyOutput::new().output("id", id);
        if let Some(extra) = self.outputs.lock().unwrap().get(node) {
            output.outputs.extend(extra.outputs.clone());
            output.secret.extend(extra.secret.clone());
        }
        output
    }
}

impl Provider for FakeProvider {
    fn apply(
        &self,
        ctx: &OperationContext<'_>,
        _kind: &str,
        inputs: &ResolvedInputs,
        previous: Option<&ProvisionRecord>,
    ) -> Result<ApplyOutput, ProviderError> {
        self.enter(ctx, Op::Apply, inputs, previous.is_some())?;
        Ok(self.output_for(ctx.node))
    }

    fn delete(
        &self,
        ctx: &OperationContext<'_>,
        _kind: &str,
        record: &ProvisionRecord,
    ) -> Result<(), ProviderError> {
        self.enter(ctx, Op::Delete, &record.inputs, true)
    }

    fn read(
        &self,
        ctx: &OperationContext<'_>,
        _kind: &str,
        inputs: &ResolvedInputs,
    ) -> Result<ApplyOutput, ProviderError> {
        self.enter(ctx, Op::Read, inputs, false)?;
        Ok(self.output_for(ctx.node))
    }

    fn requires_replace(&self, _kind: &str, previous: &ProvisionRecord, inputs: &ResolvedInputs) -> bool {
        self.replace_on
            .lock()
            .unwrap()
            .iter()
            .any(|name| previous.inputs.get(name) != inputs.get(name))
    }
}

/// Outputs with one string field
pub fn output(name: &str, value: impl Into<Value>) -> ApplyOutput {
    ApplyOutput::new().output(name, value)
}
