//! The contract every data source implements.
//!
//! The engine never talks to a database directly. It hands a bound
//! invocation to a [`BackendAdapter`] in the pre phase, receives an opaque
//! [`ExecutionHandle`] back, and later gives that handle to the adapter's
//! post phase together with a [`RowSink`] the adapter pushes rows into.
pub mod postgres;

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::binder::BoundQuery;
use crate::engine::UserContext;
use crate::error::{BackendError, Result};
use crate::model::QueryDefinition;
use crate::param::{DataType, ParamValue};

/// Adapter-owned state produced by a pre phase and consumed by a post phase.
pub struct ExecutionHandle(Box<dyn Any + Send>);

impl ExecutionHandle {
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Box::new(state))
    }

    /// Recover the adapter's state. Fails with the handle intact when it was
    /// produced by a different adapter.
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Self> {
        match self.0.downcast::<T>() {
            Ok(state) => Ok(*state),
            Err(other) => Err(Self(other)),
        }
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut::<T>()
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExecutionHandle(..)")
    }
}

/// Accumulated statements of one backend batch. Owned by the request's batch
/// run until the barrier, then consumed by [`BatchParticipant::execute_batch`].
#[derive(Debug, Default)]
pub struct BatchHandle {
    members: usize,
    state: Option<ExecutionHandle>,
}

impl BatchHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self) -> usize {
        self.members
    }

    pub(crate) fn record_member(&mut self) {
        self.members += 1;
    }

    /// The adapter's accumulator, created on first use.
    pub fn state_mut<T: Any + Send + Default>(&mut self) -> Option<&mut T> {
        self.state
            .get_or_insert_with(|| ExecutionHandle::new(T::default()))
            .downcast_mut::<T>()
    }

    pub fn into_state<T: Any>(self) -> Option<T> {
        self.state.and_then(|handle| handle.downcast::<T>().ok())
    }
}

/// What the adapter sees of an invocation in its pre phase.
pub struct BoundCall<'a> {
    pub query: &'a QueryDefinition,
    pub bound: &'a BoundQuery,
    pub user: &'a UserContext,
}

/// A connection checked out for the duration of one request.
#[async_trait]
pub trait BackendConnection: Send {
    async fn commit(&mut self) -> std::result::Result<(), BackendError>;

    async fn rollback(&mut self) -> std::result::Result<(), BackendError>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Identifies a pooled connection: datasource id plus the credential used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub datasource: String,
    pub credential: String,
}

impl ConnectionKey {
    pub fn new(datasource: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            datasource: datasource.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.credential, self.datasource)
    }
}

/// Connections opened by one request, so that every query against the same
/// datasource and credential shares a connection and a transaction.
#[derive(Default)]
pub struct ConnectionStore {
    connections: HashMap<ConnectionKey, Box<dyn BackendConnection>>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    pub fn insert(&mut self, key: ConnectionKey, conn: Box<dyn BackendConnection>) {
        self.connections.insert(key, conn);
    }

    pub fn get_mut(&mut self, key: &ConnectionKey) -> Option<&mut (dyn BackendConnection + 'static)> {
        self.connections.get_mut(key).map(|conn| conn.as_mut())
    }

    /// Typed access for the adapter that opened the connection.
    pub fn get_as<T: Any>(&mut self, key: &ConnectionKey) -> Option<&mut T> {
        self.get_mut(key)
            .and_then(|conn| conn.as_any_mut().downcast_mut::<T>())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove every connection, in key order.
    pub fn drain(&mut self) -> Vec<(ConnectionKey, Box<dyn BackendConnection>)> {
        let mut all: Vec<_> = self.connections.drain().collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.connections.keys()).finish()
    }
}

/// Receives result rows from an adapter's post phase.
#[async_trait]
pub trait RowSink: Send {
    fn add_value(&mut self, name: &str, value: ParamValue);

    /// The current row is complete.
    async fn end_row(&mut self) -> Result<()>;
}

/// Sink for invocations whose rows nobody reads.
#[derive(Debug, Default)]
pub struct DiscardRows {
    pub rows: usize,
}

#[async_trait]
impl RowSink for DiscardRows {
    fn add_value(&mut self, _name: &str, _value: ParamValue) {}

    async fn end_row(&mut self) -> Result<()> {
        self.rows += 1;
        Ok(())
    }
}

/// A pluggable data source.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether column names must be matched exactly.
    fn case_sensitive(&self) -> bool {
        false
    }

    fn supports_type(&self, data_type: &DataType) -> bool {
        data_type.is_builtin()
    }

    /// Execute (or prepare) the bound invocation. Called once per invocation.
    async fn pre_execute(
        &self,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<ExecutionHandle>;

    /// Stream the outcome of a pre phase into `sink`.
    async fn post_execute(
        &self,
        handle: ExecutionHandle,
        query: &QueryDefinition,
        sink: &mut dyn RowSink,
    ) -> Result<()>;

    /// Batch capability, when the adapter has one.
    fn batch(&self) -> Option<&dyn BatchParticipant> {
        None
    }
}

/// Optional capability: accumulate invocations and execute them in one go.
#[async_trait]
pub trait BatchParticipant: Send + Sync {
    fn is_batch_eligible(&self, query: &QueryDefinition) -> bool;

    async fn join_batch(
        &self,
        batch: &mut BatchHandle,
        call: &BoundCall<'_>,
        connections: &mut ConnectionStore,
    ) -> Result<()>;

    /// Execute everything joined so far. Returns one handle per member, in
    /// join order.
    async fn execute_batch(
        &self,
        batch: BatchHandle,
        connections: &mut ConnectionStore,
    ) -> Result<Vec<ExecutionHandle>>;

    /// Drop a batch that will never execute.
    async fn release_batch_resources(&self, batch: BatchHandle);
}

/// Recover an adapter handle, reporting a handle from another adapter as a
/// backend failure.
pub fn expect_handle<T: Any>(handle: ExecutionHandle, adapter: &str) -> Result<T> {
    handle.downcast::<T>().map_err(|_| {
        BackendError::execution(format!("{} received a handle it did not create", adapter)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_downcast() {
        let handle = ExecutionHandle::new(42u32);
        let handle = handle.downcast::<String>().unwrap_err();
        assert_eq!(handle.downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_batch_state_created_on_demand() {
        let mut batch = BatchHandle::new();
        batch.state_mut::<Vec<String>>().unwrap().push("a".into());
        batch.record_member();
        batch.state_mut::<Vec<String>>().unwrap().push("b".into());
        batch.record_member();
        assert!(batch.state_mut::<u8>().is_none());
        assert_eq!(batch.members(), 2);
        assert_eq!(batch.into_state::<Vec<String>>().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_expect_handle_rejects_foreign() {
        let err = expect_handle::<String>(ExecutionHandle::new(1u8), "pg").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Database);
    }

    #[tokio::test]
    async fn test_discard_rows_counts() {
        let mut sink = DiscardRows::default();
        sink.add_value("a", ParamValue::scalar("1"));
        sink.end_row().await.unwrap();
        sink.end_row().await.unwrap();
        assert_eq!(sink.rows, 2);
    }
}
