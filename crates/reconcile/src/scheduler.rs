//! Dependency-ordered parallel walk over a [`Dag`]
//!
//! A node is started only once every dependency has settled successfully. At
//! most `max_concurrency` tasks run at a time. When a task settles
//! unsuccessfully, its transitive dependents are marked blocked and never
//! started, while independent branches keep going.

use crate::context::CancellationToken;
use crate::error::{Error, Result};
use crate::graph::Dag;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

/// Terminal result of a scheduled task
pub trait Settle: Send {
    /// Whether dependents may start after this result
    fn unblocks_dependents(&self) -> bool;

    /// Result to record when the task panicked
    fn panicked(node: &str, message: String) -> Self;
}

/// How the walk left one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit<T> {
    /// The task ran and settled with `T`
    Completed(T),
    /// A dependency did not settle successfully
    Blocked {
        /// The dependency whose failure blocked this node
        upstream: String,
    },
    /// Cancellation stopped the walk before the node started
    NotStarted,
}

/// Runs tasks over a graph with bounded parallelism
pub struct Walker<'a> {
    dag: &'a Dag,
    max_concurrency: usize,
    cancel: &'a CancellationToken,
}

impl<'a> Walker<'a> {
    pub fn new(dag: &'a Dag, max_concurrency: usize, cancel: &'a CancellationToken) -> Self {
        Self {
            dag,
            max_concurrency,
            cancel,
        }
    }

    /// Run `task` for every node, returning visits indexed like [`Dag::ids`]
    ///
    /// Ready nodes start in insertion order. With `max_concurrency == 1` the
    /// walk is therefore a deterministic topological order.
    pub fn run<T, F>(&self, task: F) -> Result<Vec<Visit<T>>>
    where
        T: Settle,
        F: Fn(&str) -> T + Sync,
    {
        let count = self.dag.len();
        if count == 0 {
            return Ok(Vec::new());
        }

        let jobs = self.max_concurrency.clamp(1, count);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("reconcile-{i}"))
            .build()
            .map_err(|e| Error::Pool {
                message: e.to_string(),
            })?;

        let mut visits: Vec<Option<Visit<T>>> = (0..count).map(|_| None).collect();
        let mut waiting: Vec<usize> = (0..count)
            .map(|i| self.dag.dependency_indices(i).len())
            .collect();
        let mut ready: VecDeque<usize> = (0..count).filter(|&i| waiting[i] == 0).collect();

        let (tx, rx) = mpsc::channel::<(usize, T)>();
        let task = &task;
        let dag = self.dag;

        pool.in_place_scope(|scope| {
            let mut in_flight = 0usize;
            loop {
                while in_flight < jobs && !self.cancel.is_cancelled() {
                    let Some(index) = ready.pop_front() else {
                        break;
                    };
                    let tx = tx.clone();
                    in_flight += 1;
                    scope.spawn(move |_| {
                        let id = dag.id(index);
                        let result = panic::catch_unwind(AssertUnwindSafe(|| task(id)))
                            .unwrap_or_else(|payload| {
                                let message = panic_message(payload.as_ref());
                                log::error!("{id}: task panicked: {message}");
                                T::panicked(id, message)
                            });
                        // The receiver outlives the scope
                        let _ = tx.send((index, result));
                    });
                }

                if in_flight == 0 {
                    break;
                }
                let Ok((index, result)) = rx.recv() else {
                    break;
                };
                in_flight -= 1;

                if result.unblocks_dependents() {
                    for &dependent in dag.dependent_indices(index) {
                        waiting[dependent] -= 1;
                        if waiting[dependent] == 0 && visits[dependent].is_none() {
                            ready.push_back(dependent);
                        }
                    }
                } else {
                    block_dependents(dag, index, &mut visits);
                }
                visits[index] = Some(Visit::Completed(result));
            }
        });

        if self.cancel.is_cancelled() {
            let skipped = visits.iter().filter(|v| v.is_none()).count();
            if skipped > 0 {
                log::warn!("run cancelled, {skipped} nodes not started");
            }
        }

        Ok(visits
            .into_iter()
            .map(|visit| visit.unwrap_or(Visit::NotStarted))
            .collect())
    }
}

fn block_dependents<T>(dag: &Dag, failed: usize, visits: &mut [Option<Visit<T>>]) {
    let upstream = dag.id(failed);
    let mut queue: VecDeque<usize> = dag.dependent_indices(failed).iter().copied().collect();
    while let Some(index) = queue.pop_front() {
        if visits[index].is_some() {
            continue;
        }
        log::debug!("{}: blocked by '{upstream}'", dag.id(index));
        visits[index] = Some(Visit::Blocked {
            upstream: upstream.to_string(),
        });
        queue.extend(dag.dependent_indices(index).iter().copied());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
