//! In-memory backend that records every call it receives.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{
    expect_handle, BackendAdapter, BackendConnection, BatchHandle, BatchParticipant, BoundCall,
    ConnectionKey, ConnectionStore, ExecutionHandle, RowSink,
};
use crate::error::{BackendError, Result};
use crate::model::QueryDefinition;
use crate::param::ParamValue;

pub(crate) type Log = Arc<Mutex<Vec<String>>>;
pub(crate) type Row = Vec<(String, ParamValue)>;

#[derive(Default)]
pub(crate) struct RecordingAdapter {
    pub log: Log,
    rows: HashMap<String, Vec<Row>>,
    fail_on: Option<String>,
    fail_commit: bool,
    batching: bool,
    echoing: bool,
}

/// What post_execute replays: the call as logged at pre/join time and the
/// rows it produced.
struct Recorded {
    call: String,
    rows: Vec<Row>,
}

struct RecordingConnection {
    key: ConnectionKey,
    log: Log,
    fail_commit: bool,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batching(mut self) -> Self {
        self.batching = true;
        self
    }

    /// Answer queries without configured rows with one row holding their
    /// bound parameters.
    pub fn echoing(mut self) -> Self {
        self.echoing = true;
        self
    }

    pub fn failing_on(mut self, query: &str) -> Self {
        self.fail_on = Some(query.to_string());
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn with_rows(mut self, query: &str, rows: Vec<Vec<(&str, ParamValue)>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
            .collect();
        self.rows.insert(query.to_string(), rows);
        self
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn describe(call: &BoundCall<'_>) -> String {
        let args: Vec<String> = call
            .bound
            .params
            .values_by_ordinal()
            .into_iter()
            .map(|(_, name, value)| format!("{}={}", name, value.display()))
            .collect();
        format!("{}({})", call.query.id, args.join(","))
    }

    fn open(&self, call: &BoundCall<'_>, connections: &mut ConnectionStore) -> Result<Recorded> {
        if self.fail_on.as_deref() == Some(call.query.id.as_str()) {
            return Err(BackendError::from_sqlstate("23505", "duplicate key value").into());
        }
        let key = ConnectionKey::new(
            call.query.datasource.clone(),
            call.user.username.clone().unwrap_or_else(|| "default".into()),
        );
        if !connections.contains(&key) {
            self.record(format!("open:{}", key));
            connections.insert(
                key.clone(),
                Box::new(RecordingConnection {
                    key,
                    log: Arc::clone(&self.log),
                    fail_commit: self.fail_commit,
                }),
            );
        }
        let rows = match self.rows.get(&call.query.id) {
            Some(rows) => rows.clone(),
            None if self.echoing => vec![call
                .bound
                .params
                .values_by_ordinal()
                .into_iter()
                .map(|(_, name, value)| (name.to_string(), value.clone()))
                .collect()],
            None => Vec::new(),
        };
        Ok(Recorded {
            call: Self::describe(call),
            rows,
        })
    }
}

#[async_trait]
impl BackendAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn pre_execute(
        &self,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<ExecutionHandle> {
        self.record(format!("pre:{}", Self::describe(call)));
        Ok(ExecutionHandle::new(self.open(call, connections)?))
    }

    async fn post_execute(
        &self,
        handle: ExecutionHandle,
        _query: &QueryDefinition,
        sink: &mut dyn RowSink,
    ) -> Result<()> {
        let recorded: Recorded = expect_handle(handle, self.name())?;
        self.record(format!("post:{}", recorded.call));
        for row in recorded.rows {
            for (name, value) in row {
                sink.add_value(&name, value);
            }
            sink.end_row().await?;
        }
        Ok(())
    }

    fn batch(&self) -> Option<&dyn BatchParticipant> {
        if self.batching {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl BatchParticipant for RecordingAdapter {
    fn is_batch_eligible(&self, query: &QueryDefinition) -> bool {
        query.kind().is_update()
    }

    async fn join_batch(
        &self,
        batch: &mut BatchHandle,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<()> {
        self.record(format!("join:{}", Self::describe(call)));
        let recorded = self.open(call, connections)?;
        batch
            .state_mut::<Vec<Recorded>>()
            .ok_or_else(|| BackendError::execution("foreign batch state"))?
            .push(recorded);
        Ok(())
    }

    async fn execute_batch(
        &self,
        batch: BatchHandle,
        _connections: &mut ConnectionStore,
    ) -> Result<Vec<ExecutionHandle>> {
        let members = batch.members();
        self.record(format!("execute_batch:{}", members));
        let recorded = batch.into_state::<Vec<Recorded>>().unwrap_or_default();
        Ok(recorded.into_iter().map(ExecutionHandle::new).collect())
    }

    async fn release_batch_resources(&self, batch: BatchHandle) {
        self.record(format!("release:{}", batch.members()));
    }
}

#[async_trait]
impl BackendConnection for RecordingConnection {
    async fn commit(&mut self) -> std::result::Result<(), BackendError> {
        if self.fail_commit {
            self.log.lock().push(format!("commit_failed:{}", self.key));
            return Err(BackendError::from_sqlstate("40001", "could not serialize access"));
        }
        self.log.lock().push(format!("commit:{}", self.key));
        Ok(())
    }

    async fn rollback(&mut self) -> std::result::Result<(), BackendError> {
        self.log.lock().push(format!("rollback:{}", self.key));
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
