//! Bounded worker pool shared by every workload phase.
//!
//! Work is dispatched lazily: a target is only handed to a worker when a
//! slot is free, so once a stop signal fires (or cancellation is requested)
//! the untried targets are recorded without ever being invoked. Outcomes are
//! returned in completion order.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{AggregatorHandle, FailureReason, Outcome};
use crate::target::Target;
use crate::telemetry::SharedObserver;

/// Submission order for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchOrder {
    /// As given.
    #[default]
    Submission,
    /// Spread evenly over `groups` underlying resources (e.g. nodes).
    Interleaved { groups: usize },
}

/// Reorder `items` so that consecutive entries come from different groups.
///
/// With `n` items and `groups` resources the group size is `n / groups`
/// (at least 1); items are taken with that stride, starting from each offset
/// in turn. Every item appears exactly once.
pub fn interleave<T>(items: Vec<T>, groups: usize) -> Vec<T> {
    let len = items.len();
    if len == 0 || groups <= 1 {
        return items;
    }
    let group_size = (len / groups).max(1);

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(len);
    for offset in 0..group_size {
        for i in (offset..len).step_by(group_size) {
            if let Some(item) = slots[i].take() {
                ordered.push(item);
            }
        }
    }
    ordered
}

/// Runs one work closure per target under a concurrency bound.
#[derive(Clone)]
pub struct Dispatcher {
    concurrency: usize,
    order: DispatchOrder,
    observer: SharedObserver,
    cancel: CancellationToken,
    sink: Option<AggregatorHandle>,
}

impl Dispatcher {
    pub fn new(concurrency: usize, observer: SharedObserver, cancel: CancellationToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            order: DispatchOrder::Submission,
            observer,
            cancel,
            sink: None,
        }
    }

    /// Strict one-at-a-time dispatch for baseline measurements.
    pub fn sequential(observer: SharedObserver, cancel: CancellationToken) -> Self {
        Self::new(1, observer, cancel)
    }

    pub fn with_order(mut self, order: DispatchOrder) -> Self {
        self.order = order;
        self
    }

    /// Forward every outcome to an aggregation task as it completes.
    pub fn with_sink(mut self, sink: AggregatorHandle) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `work` for every item; see the module docs for stop semantics.
    pub async fn run_all<R, W, Fut, S>(&self, items: Vec<R>, work: W, stop_on_signal: S) -> Vec<Outcome>
    where
        R: AsRef<Target> + Send + 'static,
        W: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
        S: Fn(&Outcome) -> bool,
    {
        let total = items.len();
        let ordered = match self.order {
            DispatchOrder::Submission => items,
            DispatchOrder::Interleaved { groups } => interleave(items, groups),
        };
        let mut queue: VecDeque<R> = ordered.into();
        let work = Arc::new(work);

        let mut running: JoinSet<(usize, Outcome)> = JoinSet::new();
        let mut in_flight: HashMap<usize, Target> = HashMap::new();
        let mut outcomes = Vec::with_capacity(total);
        let mut stopped = false;
        let mut next_id = 0usize;

        loop {
            while !stopped && running.len() < self.concurrency && !self.cancel.is_cancelled() {
                let Some(item) = queue.pop_front() else {
                    break;
                };
                let target = item.as_ref().clone();
                self.observer.on_dispatch(&target);

                let id = next_id;
                next_id += 1;
                in_flight.insert(id, target.clone());

                let work = Arc::clone(&work);
                running.spawn(async move {
                    let outcome = match AssertUnwindSafe(work(item)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => Outcome::failed(target, FailureReason::Error, "worker panicked"),
                    };
                    (id, outcome)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    outcome
                }
                Err(e) => {
                    tracing::error!(error = %e, "Worker task failed");
                    continue;
                }
            };

            if !stopped && stop_on_signal(&outcome) {
                stopped = true;
            }
            self.complete(outcome, &mut outcomes).await;
        }

        for (_, target) in in_flight.drain() {
            let outcome = Outcome::failed(target, FailureReason::Error, "worker task failed");
            self.complete(outcome, &mut outcomes).await;
        }

        let reason = if self.cancel.is_cancelled() && !stopped {
            FailureReason::Interrupted
        } else {
            FailureReason::Skipped
        };
        for item in queue {
            let target = item.as_ref().clone();
            self.observer.on_skipped(&target, reason);
            let outcome = Outcome::not_dispatched(target, reason);
            if let Some(sink) = &self.sink {
                sink.record(outcome.clone()).await;
            }
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn complete(&self, outcome: Outcome, outcomes: &mut Vec<Outcome>) {
        self.observer.on_outcome(&outcome);
        if let Some(sink) = &self.sink {
            sink.record(outcome.clone()).await;
        }
        outcomes.push(outcome);
    }
}

/// Stop signal used by capacity-style batches.
pub fn stop_on_exhaustion(outcome: &Outcome) -> bool {
    outcome.is_capacity_exhausted()
}

/// Never stop early.
pub fn never_stop(_outcome: &Outcome) -> bool {
    false
}
