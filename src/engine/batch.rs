//! Batch requests: every item runs its pre phase first, the backend executes
//! the accumulated batch once, then every item runs its post phase in the
//! original order.
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::{InvocationId, PendingResult, Phase, RequestContext};
use super::Engine;
use crate::backend::{BackendAdapter, BatchHandle, BoundCall};
use crate::error::{BackendError, DataServiceError, Result};
use crate::param::ParamMap;
use crate::projection::OutputSink;

impl Engine {
    /// Run `operation` once per parameter set as a single batch request.
    pub async fn execute_batch(
        &self,
        ctx: &mut RequestContext,
        operation: &str,
        items: Vec<ParamMap>,
        out: &mut dyn OutputSink,
    ) -> Result<()> {
        let op = self.operation(operation)?;
        let query_id = op.query_id().to_string();
        if items.is_empty() {
            return Ok(());
        }

        ctx.begin_batch(items.len());
        info!(operation, items = items.len(), "executing batch");

        let mut ids = Vec::with_capacity(items.len());
        for params in items {
            let snapshot = params.snapshot();
            let params = match self.operation_params(op, params) {
                Ok(params) => params,
                Err(err) => {
                    if let Err(cleanup) = self.finalize(ctx, false).await {
                        warn!(error = %cleanup, "rollback after failure also failed");
                    }
                    return Err(err.with_request(operation, snapshot));
                }
            };
            let id = ctx.next_invocation(0);
            self.invoke(ctx, &query_id, params, Phase::PreOnly, id, &mut *out)
                .await?;
            ids.push(id);
        }
        for id in ids {
            self.invoke(ctx, &query_id, ParamMap::new(), Phase::PostOnly, id, &mut *out)
                .await?;
        }
        ctx.batch = None;
        Ok(())
    }

    /// Add a bound invocation to the request's open batch.
    pub(crate) async fn join_batch(
        &self,
        ctx: &mut RequestContext,
        adapter: &Arc<dyn BackendAdapter>,
        call: &BoundCall<'_>,
        id: InvocationId,
    ) -> Result<()> {
        let participant = adapter.batch().ok_or_else(|| {
            DataServiceError::IllegalArgument(format!("{} cannot batch", adapter.name()))
        })?;
        let run = ctx
            .batch
            .as_mut()
            .ok_or_else(|| DataServiceError::IllegalArgument("no batch is open".into()))?;

        match &run.adapter {
            Some(owner) if !Arc::ptr_eq(owner, adapter) => {
                return Err(DataServiceError::IllegalArgument(format!(
                    "query '{}' would mix backends within one batch",
                    call.query.id
                )))
            }
            Some(_) => {}
            None => run.adapter = Some(Arc::clone(adapter)),
        }

        let handle = run.handle.get_or_insert_with(BatchHandle::new);
        participant
            .join_batch(handle, call, &mut ctx.connections)
            .await?;
        handle.record_member();
        run.joined.push(id);
        debug!(query = %call.query.id, invocation = %id, members = handle.members(), "joined batch");
        Ok(())
    }

    /// Count one finished pre phase. The last one executes the batch and
    /// hands each member its result. Returns whether this call was the last.
    pub(crate) async fn count_batch_member(&self, ctx: &mut RequestContext) -> Result<bool> {
        let Some(run) = ctx.batch.as_mut() else {
            return Ok(false);
        };
        run.seen += 1;
        if run.seen < run.expected {
            return Ok(false);
        }
        run.executed = true;

        let (Some(handle), Some(adapter)) = (run.handle.take(), run.adapter.clone()) else {
            return Ok(true);
        };
        let joined = std::mem::take(&mut run.joined);
        let participant = adapter.batch().ok_or_else(|| {
            DataServiceError::IllegalArgument(format!("{} cannot batch", adapter.name()))
        })?;

        info!(backend = adapter.name(), members = handle.members(), "executing batch");
        let results = participant
            .execute_batch(handle, &mut ctx.connections)
            .await?;
        if results.len() != joined.len() {
            return Err(BackendError::execution(format!(
                "{} returned {} batch results for {} members",
                adapter.name(),
                results.len(),
                joined.len()
            ))
            .into());
        }

        for (id, result) in joined.into_iter().zip(results) {
            if let Some(pending) = ctx.pending.get_mut(&id) {
                pending.result = PendingResult::Ready(result);
            }
        }
        Ok(true)
    }

    /// Count one finished top-level post phase of an executed batch.
    pub(crate) fn count_batch_post(&self, ctx: &mut RequestContext, id: InvocationId) {
        if id.depth > 0 {
            return;
        }
        let Some(run) = ctx.batch.as_mut() else {
            return;
        };
        if !run.executed {
            return;
        }
        run.posts_remaining = run.posts_remaining.saturating_sub(1);
        if run.posts_remaining == 0 {
            ctx.batch = None;
        }
    }

    /// Drop a batch that will never reach its barrier.
    pub(crate) async fn abandon_batch(&self, ctx: &mut RequestContext) {
        let Some(mut run) = ctx.batch.take() else {
            return;
        };
        if let (Some(handle), Some(adapter)) = (run.handle.take(), run.adapter.take()) {
            match adapter.batch() {
                Some(participant) => {
                    warn!(members = handle.members(), "releasing unexecuted batch");
                    participant.release_batch_resources(handle).await;
                }
                None => warn!(backend = adapter.name(), "batch without a participant"),
            }
        }
    }
}
