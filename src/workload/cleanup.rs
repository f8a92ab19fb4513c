//! Namespace cleanup.
//!
//! Deleting a namespace removes everything a workload put in it. Deletes go
//! through the retry engine with a smaller concurrency bound than creation,
//! since namespace finalization is heavy on the API server.

use chrono::Utc;
use tokio::time::Instant;

use super::{outcome_from_retry, WorkloadContext, WorkloadReport};
use crate::aggregate::Outcome;
use crate::dispatcher::never_stop;
use crate::target::{OperationKind, OperationRequest, Target};

/// Namespaces deleted in parallel.
pub const DEFAULT_CLEANUP_CONCURRENCY: usize = 5;

/// Delete every namespace in `scopes`. Metric: `delete` (time of the delete
/// call, not of namespace finalization).
pub async fn delete_scopes(ctx: &WorkloadContext, scopes: Vec<String>, concurrency: usize) -> WorkloadReport {
    let started_at = Utc::now();
    let started = Instant::now();
    tracing::info!(namespaces = scopes.len(), concurrency, "Deleting namespaces");

    let work_ctx = ctx.clone();
    let work = move |request: OperationRequest| {
        let ctx = work_ctx.clone();
        async move {
            let scope = request.target().clone();
            let call_started = Instant::now();
            match ctx.submit(&request, || ctx.controller.delete(&scope)).await {
                Ok(()) => {
                    Outcome::succeeded(scope).with_duration("delete", call_started.elapsed().as_secs_f64())
                }
                Err(e) => outcome_from_retry(scope, &e),
            }
        }
    };

    let requests = scopes
        .into_iter()
        .map(|scope| ctx.request(Target::scope(scope), OperationKind::Delete))
        .collect();
    let outcomes = ctx.dispatcher(concurrency).run_all(requests, work, never_stop).await;
    WorkloadReport::new("cleanup", outcomes, started_at, started)
}
