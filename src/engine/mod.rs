//! Registry of queries, operations and backends, and the request-level
//! entry points built on the execution protocol.
mod batch;
mod context;
mod protocol;

pub use context::*;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::backend::BackendAdapter;
use crate::error::{DataServiceError, Result};
use crate::model::{Operation, QueryDefinition};
use crate::param::{ExternalParamCollection, ParamMap, ParamOrigin};
use crate::projection::{relay_params, OutputSink};

/// Loaded service. Read-only once built and shared between requests.
#[derive(Default)]
pub struct Engine {
    queries: HashMap<String, Arc<QueryDefinition>>,
    operations: BTreeMap<String, Operation>,
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut queries: Vec<&str> = self.queries.keys().map(String::as_str).collect();
        queries.sort_unstable();
        let mut backends: Vec<String> = self
            .backends
            .iter()
            .map(|(ds, adapter)| format!("{}={}", ds, adapter.name()))
            .collect();
        backends.sort_unstable();
        f.debug_struct("Engine")
            .field("queries", &queries)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field("backends", &backends)
            .finish()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `datasource` with `adapter`.
    pub fn register_backend(&mut self, datasource: impl Into<String>, adapter: Arc<dyn BackendAdapter>) {
        self.backends.insert(datasource.into(), adapter);
    }

    pub fn add_query(&mut self, query: QueryDefinition) {
        self.queries.insert(query.id.clone(), Arc::new(query));
    }

    pub fn add_operation(&mut self, operation: Operation) {
        self.operations.insert(operation.name.clone(), operation);
    }

    pub fn query(&self, id: &str) -> Result<Arc<QueryDefinition>> {
        self.queries
            .get(id)
            .cloned()
            .ok_or_else(|| DataServiceError::IllegalArgument(format!("unknown query '{}'", id)))
    }

    pub fn operation(&self, name: &str) -> Result<&Operation> {
        self.operations
            .get(name)
            .ok_or_else(|| DataServiceError::IllegalArgument(format!("unknown operation '{}'", name)))
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    pub(crate) fn backend_for(&self, query: &QueryDefinition) -> Result<Arc<dyn BackendAdapter>> {
        self.backends.get(&query.datasource).cloned().ok_or_else(|| {
            DataServiceError::IllegalArgument(format!(
                "query '{}' uses unknown datasource '{}'",
                query.id, query.datasource
            ))
        })
    }

    /// Check that every reference between definitions resolves.
    pub fn verify(&self) -> Result<()> {
        for query in self.queries.values() {
            self.backend_for(query)?;
            let Some(section) = &query.result else {
                continue;
            };
            for call in section.nested_calls() {
                self.query(&call.query_id).map_err(|_| {
                    DataServiceError::IllegalArgument(format!(
                        "query '{}' calls unknown query '{}'",
                        query.id, call.query_id
                    ))
                })?;
            }
        }
        for operation in self.operations.values() {
            self.query(operation.query_id()).map_err(|_| {
                DataServiceError::IllegalArgument(format!(
                    "operation '{}' targets unknown query '{}'",
                    operation.name,
                    operation.query_id()
                ))
            })?;
        }
        Ok(())
    }

    /// Map request parameters onto the operation's target query.
    fn operation_params(&self, operation: &Operation, request: ParamMap) -> Result<ParamMap> {
        if operation.call.with_params.is_empty() {
            return Ok(request);
        }
        let target = self.query(operation.query_id())?;
        let mut supplied = ExternalParamCollection::new(false);
        for (name, value) in request.iter() {
            supplied.add(ParamOrigin::QueryParam, name, value.clone());
        }
        relay_params(&operation.call, &supplied, &target)
    }

    /// Run one operation to completion.
    pub async fn execute(
        &self,
        ctx: &mut RequestContext,
        operation: &str,
        params: ParamMap,
        out: &mut dyn OutputSink,
    ) -> Result<()> {
        let op = self.operation(operation)?;
        let query_id = op.query_id().to_string();
        let snapshot = params.snapshot();
        let params = self
            .operation_params(op, params)
            .map_err(|err| err.with_request(operation, snapshot))?;
        let id = ctx.next_invocation(0);
        info!(operation, query = %query_id, "executing operation");
        self.invoke(ctx, &query_id, params, Phase::Both, id, out)
            .await
    }

    /// Start a client-controlled transaction spanning several operations.
    pub fn begin_boxcar(&self, ctx: &mut RequestContext) {
        ctx.boxcar = true;
    }

    /// Commit everything the boxcar did.
    pub async fn close_boxcar(&self, ctx: &mut RequestContext) -> Result<()> {
        ctx.boxcar = false;
        ctx.exports = ParamMap::new();
        self.finalize(ctx, true).await
    }

    /// Roll back everything the boxcar did.
    pub async fn abort_boxcar(&self, ctx: &mut RequestContext) -> Result<()> {
        ctx.boxcar = false;
        ctx.exports = ParamMap::new();
        self.finalize(ctx, false).await
    }
}
