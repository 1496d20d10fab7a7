//! PostgreSQL backend over pooled `tokio-postgres` clients.
//!
//! Statements run in the pre phase on the request's connection for the
//! caller's credential; their rows are buffered in the execution handle and
//! replayed into the row sink by the post phase.
mod connection;
mod query;

pub use connection::{create_pool, Credential, PgConnection, PgDatasourceConfig, SslMode};
pub use query::{
    backend_error, run_statement, PgOutcome, PgStatement, TextParam, UPDATED_ROW_COUNT,
};

use async_trait::async_trait;
use deadpool_postgres::Pool;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{
    expect_handle, BackendAdapter, BatchHandle, BatchParticipant, BoundCall, ConnectionKey,
    ConnectionStore, ExecutionHandle, RowSink,
};
use crate::error::{BackendError, Result};
use crate::model::QueryDefinition;
use crate::param::ParamValue;

pub struct PostgresAdapter {
    datasource: String,
    config: PgDatasourceConfig,
    pools: Mutex<HashMap<String, Pool>>,
}

impl PostgresAdapter {
    pub fn new(datasource: impl Into<String>, config: PgDatasourceConfig) -> Self {
        Self {
            datasource: datasource.into(),
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PgDatasourceConfig {
        &self.config
    }

    fn pool_for(&self, credential: &Credential) -> Result<Pool> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&credential.username) {
            return Ok(pool.clone());
        }
        let pool = create_pool(&self.config, credential)?;
        pools.insert(credential.username.clone(), pool.clone());
        Ok(pool)
    }

    /// The request's connection for this call's credential, opened on first
    /// use.
    async fn connection_for(
        &self,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<ConnectionKey> {
        let credential = self.config.credential_for(call.user);
        let key = ConnectionKey::new(self.datasource.clone(), credential.username.clone());
        if !connections.contains(&key) {
            let pool = self.pool_for(&credential)?;
            let auto_commit = call
                .query
                .properties
                .auto_commit
                .unwrap_or(self.config.auto_commit);
            let conn = PgConnection::open(&pool, auto_commit).await?;
            info!(connection = %key, auto_commit, "connection opened");
            connections.insert(key.clone(), Box::new(conn));
        }
        Ok(key)
    }

    async fn statement_for(
        &self,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<PgStatement> {
        let key = self.connection_for(call, connections).await?;
        PgStatement::prepare(key, call.bound, call.query.kind(), &call.query.properties)
    }

    async fn run(
        &self,
        statement: &PgStatement,
        connections: &mut ConnectionStore,
    ) -> Result<PgOutcome> {
        let conn = connections
            .get_as::<PgConnection>(&statement.key)
            .ok_or_else(|| {
                BackendError::connection(format!("no open connection for {}", statement.key))
            })?;
        debug!(sql = %statement.sql, params = statement.params.len(), "running statement");
        run_statement(&conn.client, statement).await
    }
}

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    fn name(&self) -> &str {
        "postgresql"
    }

    async fn pre_execute(
        &self,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<ExecutionHandle> {
        let statement = self.statement_for(call, connections).await?;
        let outcome = self.run(&statement, connections).await?;
        Ok(ExecutionHandle::new(outcome))
    }

    async fn post_execute(
        &self,
        handle: ExecutionHandle,
        query: &QueryDefinition,
        sink: &mut dyn RowSink,
    ) -> Result<()> {
        let outcome: PgOutcome = expect_handle(handle, self.name())?;
        if query.properties.return_updated_row_count && !query.properties.return_generated_keys {
            let count = outcome.affected.unwrap_or(0);
            sink.add_value(UPDATED_ROW_COUNT, ParamValue::Scalar(count.to_string()));
            return sink.end_row().await;
        }
        for row in outcome.rows {
            for (name, value) in row {
                sink.add_value(&name, value);
            }
            sink.end_row().await?;
        }
        Ok(())
    }

    fn batch(&self) -> Option<&dyn BatchParticipant> {
        Some(self)
    }
}

/// Batched statements are accumulated and then run one after another on
/// their request connections when the batch executes.
#[async_trait]
impl BatchParticipant for PostgresAdapter {
    fn is_batch_eligible(&self, query: &QueryDefinition) -> bool {
        query.kind().is_update() && !query.properties.return_generated_keys
    }

    async fn join_batch(
        &self,
        batch: &mut BatchHandle,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<()> {
        let statement = self.statement_for(call, connections).await?;
        batch
            .state_mut::<Vec<PgStatement>>()
            .ok_or_else(|| BackendError::execution("batch holds another adapter's statements"))?
            .push(statement);
        Ok(())
    }

    async fn execute_batch(
        &self,
        batch: BatchHandle,
        connections: &mut ConnectionStore,
    ) -> Result<Vec<ExecutionHandle>> {
        let statements = batch.into_state::<Vec<PgStatement>>().unwrap_or_default();
        let mut handles = Vec::with_capacity(statements.len());
        for statement in &statements {
            let outcome = self.run(statement, connections).await?;
            handles.push(ExecutionHandle::new(outcome));
        }
        Ok(handles)
    }

    async fn release_batch_resources(&self, batch: BatchHandle) {
        debug!(members = batch.members(), "discarding unexecuted statements");
    }
}
