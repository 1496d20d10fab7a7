//! The two-phase execution protocol.
//!
//! ```text
//! Unbound ──pre──▶ PreExecuted ──post──▶ PostExecuted ──▶ Finalized
//!    │                  │                      │
//!    └──────── error ───┴──────── error ───────┴──▶ Finalized (rollback)
//! ```
//!
//! The pre phase applies defaults, validates, binds and hands the bound
//! invocation to the backend (or to the request's open batch). The post phase
//! streams the backend's outcome through projection. Finalization commits or
//! rolls back every connection the request opened.
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::{
    InvocationId, InvocationState, PendingInvocation, PendingResult, Phase, RequestContext,
};
use super::Engine;
use crate::backend::{BackendAdapter, BoundCall, DiscardRows};
use crate::defaults::apply_defaults;
use crate::error::{DataServiceError, Result};
use crate::model::{HookEvent, HookPoint, QueryDefinition, QueryHook};
use crate::param::{ParamMap, ParamSnapshot};
use crate::projection::{OutputSink, RowProjector};

impl Engine {
    /// Run `phase` of one invocation of `query_id`.
    ///
    /// `PostOnly` ignores `params`; it uses the values stored by the pre phase
    /// of the same `id`.
    pub fn invoke<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        query_id: &'a str,
        params: ParamMap,
        phase: Phase,
        id: InvocationId,
        out: &'a mut dyn OutputSink,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let snapshot = match phase {
                Phase::PostOnly => ctx
                    .pending
                    .get(&id)
                    .map(|p| p.params.snapshot())
                    .unwrap_or_default(),
                _ => params.snapshot(),
            };
            let outcome = self.run_phases(ctx, query_id, params, phase, id, out).await;

            match outcome {
                Ok(finalize) => {
                    if finalize {
                        self.finalize(ctx, true)
                            .await
                            .map_err(|err| err.with_request(query_id, snapshot))?;
                    }
                    Ok(())
                }
                Err(err) => {
                    warn!(query = query_id, invocation = %id, error = %err, "invocation failed");
                    ctx.pending.remove(&id);
                    ctx.set_state(id, InvocationState::Finalized);
                    if let Err(cleanup) = self.finalize(ctx, false).await {
                        warn!(error = %cleanup, "rollback after failure also failed");
                    }
                    Err(err.with_request(query_id, snapshot))
                }
            }
        }
        .boxed()
    }

    /// Returns whether the request should be finalized now.
    async fn run_phases(
        &self,
        ctx: &mut RequestContext,
        query_id: &str,
        params: ParamMap,
        phase: Phase,
        id: InvocationId,
        out: &mut dyn OutputSink,
    ) -> Result<bool> {
        let query = self.query(query_id)?;
        let adapter = self.backend_for(&query)?;

        let mut closed_batch = false;
        if phase.runs_pre() {
            closed_batch = self
                .pre_phase(ctx, &query, &adapter, params, phase, id)
                .await?;
        }
        if phase.runs_post() {
            self.post_phase(ctx, &query, adapter.as_ref(), id, out)
                .await?;
        }

        Ok(should_finalize(ctx, &query, phase, id, closed_batch))
    }

    /// Returns whether this call executed the request's batch.
    async fn pre_phase(
        &self,
        ctx: &mut RequestContext,
        query: &QueryDefinition,
        adapter: &Arc<dyn BackendAdapter>,
        mut params: ParamMap,
        phase: Phase,
        id: InvocationId,
    ) -> Result<bool> {
        apply_defaults(&query.params, &mut params, &ctx.exports, &ctx.user)?;
        let bound = query
            .template()
            .bind(&params, |ty| adapter.supports_type(ty))?;
        validate(query, &params)?;
        debug!(
            query = %query.id,
            invocation = %id,
            placeholders = bound.params.len(),
            "bound"
        );
        fire_hook(
            query.input_hook.as_deref(),
            HookPoint::Input,
            &query.id,
            &bound.params.snapshot(),
        );

        let user = ctx.user.clone();
        let call = BoundCall {
            query,
            bound: &bound,
            user: &user,
        };
        let batching = phase == Phase::PreOnly
            && ctx.batch.is_some()
            && query.properties.batch_enabled
            && adapter
                .batch()
                .is_some_and(|participant| participant.is_batch_eligible(query));

        let result = if batching {
            self.join_batch(ctx, adapter, &call, id).await?;
            PendingResult::Batched
        } else {
            PendingResult::Ready(adapter.pre_execute(&call, &mut ctx.connections).await?)
        };
        ctx.pending
            .insert(id, PendingInvocation { result, params });
        ctx.set_state(id, InvocationState::PreExecuted);

        if phase == Phase::PreOnly {
            return self.count_batch_member(ctx).await;
        }
        Ok(false)
    }

    async fn post_phase(
        &self,
        ctx: &mut RequestContext,
        query: &QueryDefinition,
        adapter: &dyn BackendAdapter,
        id: InvocationId,
        out: &mut dyn OutputSink,
    ) -> Result<()> {
        let pending = ctx.pending.remove(&id).ok_or_else(|| {
            DataServiceError::IllegalArgument(format!(
                "post phase of '{}' without a pre phase (invocation {})",
                query.id, id
            ))
        })?;
        let handle = match pending.result {
            PendingResult::Ready(handle) => handle,
            PendingResult::Batched => {
                return Err(DataServiceError::IllegalArgument(format!(
                    "post phase of '{}' before its batch executed",
                    query.id
                )))
            }
        };
        self.count_batch_post(ctx, id);

        fire_hook(
            query.output_hook.as_deref(),
            HookPoint::Output,
            &query.id,
            &pending.params.snapshot(),
        );

        match &query.result {
            Some(section) => {
                if let Some(element) = &section.element {
                    out.start_element(element, section.namespace.as_deref())?;
                }
                let mut sink = RowProjector::new(
                    self,
                    ctx,
                    &mut *out,
                    query,
                    section,
                    &pending.params,
                    id.depth,
                )
                .case_sensitive(adapter.case_sensitive());
                adapter.post_execute(handle, query, &mut sink).await?;
                debug!(query = %query.id, invocation = %id, rows = sink.rows(), "projected");
                if section.element.is_some() {
                    out.end_element()?;
                }
            }
            None => {
                let mut sink = DiscardRows::default();
                adapter.post_execute(handle, query, &mut sink).await?;
            }
        }

        ctx.set_state(id, InvocationState::PostExecuted);
        Ok(())
    }

    /// Commit (or roll back) and release every connection the request holds.
    /// An open boxcar defers commits; rollbacks always happen.
    pub(crate) async fn finalize(&self, ctx: &mut RequestContext, commit: bool) -> Result<()> {
        if !commit {
            self.abandon_batch(ctx).await;
            // A rollback ends any open boxcar along with its exports.
            ctx.boxcar = false;
            ctx.exports = ParamMap::new();
        }
        if commit && ctx.boxcar {
            debug!("boxcar open, commit deferred");
            return Ok(());
        }

        let mut failure = None;
        for (key, mut conn) in ctx.connections.drain() {
            let committing = commit && failure.is_none();
            let result = if committing {
                conn.commit().await
            } else {
                conn.rollback().await
            };
            match result {
                Ok(()) => debug!(connection = %key, committing, "released"),
                Err(err) if committing => failure = Some(err),
                Err(err) => warn!(connection = %key, error = %err, "rollback failed"),
            }
        }

        let done = failure.is_none() && commit;
        for state in ctx.states.values_mut() {
            let finished = !done || *state == InvocationState::PostExecuted;
            if finished {
                *state = InvocationState::Finalized;
            }
        }
        if !done {
            ctx.pending.clear();
        }

        match failure {
            Some(err) => Err(err.into()),
            None => {
                info!(committed = commit, "request finalized");
                Ok(())
            }
        }
    }
}

/// Finalize on success when this is the outermost call and no batch is
/// still accumulating or streaming, or when a pre-only call of a query with
/// no output just executed the batch.
fn should_finalize(
    ctx: &RequestContext,
    query: &QueryDefinition,
    phase: Phase,
    id: InvocationId,
    closed_batch: bool,
) -> bool {
    if id.depth > 0 {
        return false;
    }
    match phase {
        Phase::PreOnly => closed_batch && !query.has_result(),
        Phase::PostOnly | Phase::Both => !ctx.mid_batch(),
    }
}

/// First rejection wins.
fn validate(query: &QueryDefinition, params: &ParamMap) -> Result<()> {
    for def in &query.params {
        let Some(value) = params.get(&def.name) else {
            continue;
        };
        for validator in &def.validators {
            validator
                .validate(def, value)
                .map_err(|message| DataServiceError::Validation {
                    param: def.name.clone(),
                    message: format!("{} ({})", message, validator.name()),
                })?;
        }
    }
    Ok(())
}

fn fire_hook(hook: Option<&dyn QueryHook>, point: HookPoint, query_id: &str, params: &ParamSnapshot) {
    let Some(hook) = hook else {
        return;
    };
    let event = HookEvent {
        point,
        query_id,
        params,
    };
    if let Err(err) = hook.on_event(&event) {
        warn!(query = query_id, ?point, error = %err, "hook failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UserContext;
    use crate::error::ErrorKind;
    use crate::model::{CallQuery, GroupNode, Operation, ResultSection, StaticNode};
    use crate::param::{DataType, LengthValidator, QueryParam};
    use crate::projection::JsonOutput;
    use crate::testing::RecordingAdapter;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct RecordingHook {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl QueryHook for RecordingHook {
        fn on_event(&self, event: &HookEvent<'_>) -> anyhow::Result<()> {
            self.seen
                .lock()
                .push(format!("{:?}:{}:{}", event.point, event.query_id, event.params));
            if self.fail {
                anyhow::bail!("hook refused");
            }
            Ok(())
        }
    }

    fn names_query() -> QueryDefinition {
        QueryDefinition::new(
            "names",
            "main",
            "SELECT name FROM people WHERE name LIKE :prefix",
            vec![QueryParam::new("prefix", DataType::String)
                .with_validator(Arc::new(LengthValidator { min: None, max: Some(3) }))],
        )
        .with_result(ResultSection::new(
            Some("people"),
            GroupNode::new("person").child(StaticNode::column("name", "name")),
        ))
    }

    fn engine_with(adapter: RecordingAdapter, query: QueryDefinition) -> Engine {
        let mut engine = Engine::new();
        engine.register_backend("main", Arc::new(adapter));
        let id = query.id.clone();
        engine.add_query(query);
        engine.add_operation(Operation::new(id.clone(), CallQuery::new(id)));
        engine
    }

    #[tokio::test]
    async fn test_failing_hooks_do_not_stop_invocation() {
        let input = Arc::new(RecordingHook {
            fail: true,
            ..Default::default()
        });
        let output = Arc::new(RecordingHook::default());
        let query = names_query()
            .with_input_hook(input.clone())
            .with_output_hook(output.clone());
        let adapter = RecordingAdapter::new().with_rows(
            "names",
            vec![vec![("name", "Ann".into())], vec![("name", "Abe".into())]],
        );
        let log = Arc::clone(&adapter.log);
        let engine = engine_with(adapter, query);

        let mut ctx = RequestContext::new(UserContext::anonymous());
        let mut out = JsonOutput::new(Vec::new());
        engine
            .execute(&mut ctx, "names", ParamMap::from_iter([("prefix", "A%")]), &mut out)
            .await
            .unwrap();

        assert_eq!(input.seen.lock().len(), 1);
        let seen = output.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("Output:names:"));
        assert!(seen[0].contains("A%"));
        assert!(log.lock().contains(&"commit:default@main".to_string()));
    }

    #[tokio::test]
    async fn test_validation_failure_names_validator() {
        let adapter = RecordingAdapter::new();
        let log = Arc::clone(&adapter.log);
        let engine = engine_with(adapter, names_query());

        let mut ctx = RequestContext::new(UserContext::anonymous());
        let mut out = JsonOutput::new(Vec::new());
        let err = engine
            .execute(&mut ctx, "names", ParamMap::from_iter([("prefix", "Anna%")]), &mut out)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("(length)"));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_param_precedes_validation() {
        let engine = engine_with(RecordingAdapter::new(), names_query());
        let mut ctx = RequestContext::new(UserContext::anonymous());
        let mut out = JsonOutput::new(Vec::new());
        let err = engine
            .execute(&mut ctx, "names", ParamMap::new(), &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleParameters);
    }

    #[tokio::test]
    async fn test_post_without_pre_is_rejected() {
        let engine = engine_with(RecordingAdapter::new(), names_query());
        let mut ctx = RequestContext::new(UserContext::anonymous());
        let mut out = JsonOutput::new(Vec::new());
        let id = ctx.next_invocation(0);
        let err = engine
            .invoke(&mut ctx, "names", ParamMap::new(), Phase::PostOnly, id, &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        assert_eq!(ctx.state_of(id), InvocationState::Finalized);
    }

    #[tokio::test]
    async fn test_split_phases_finalize_once_after_post() {
        let adapter = RecordingAdapter::new()
            .with_rows("names", vec![vec![("name", "Ann".into())]]);
        let log = Arc::clone(&adapter.log);
        let engine = engine_with(adapter, names_query());
        let mut ctx = RequestContext::new(UserContext::anonymous());
        let mut out = JsonOutput::new(Vec::new());
        let id = ctx.next_invocation(0);

        engine
            .invoke(
                &mut ctx,
                "names",
                ParamMap::from_iter([("prefix", "A%")]),
                Phase::PreOnly,
                id,
                &mut out,
            )
            .await
            .unwrap();
        assert_eq!(ctx.state_of(id), InvocationState::PreExecuted);
        assert!(log.lock().iter().all(|e| !e.starts_with("commit")));

        engine
            .invoke(&mut ctx, "names", ParamMap::new(), Phase::PostOnly, id, &mut out)
            .await
            .unwrap();
        assert_eq!(ctx.state_of(id), InvocationState::Finalized);
        assert_eq!(
            log.lock().iter().filter(|e| e.starts_with("commit")).count(),
            1
        );
    }
}
