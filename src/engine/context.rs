use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::backend::{BackendAdapter, BatchHandle, ConnectionStore, ExecutionHandle};
use crate::param::ParamMap;
use crate::projection::VisibleChildren;

/// The caller on whose behalf a request runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    pub username: Option<String>,
    pub tenant_id: Option<String>,
    pub roles: BTreeSet<String>,
}

impl UserContext {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Identity of one invocation within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId {
    pub depth: usize,
    pub seq: u64,
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.depth, self.seq)
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Unbound,
    PreExecuted,
    PostExecuted,
    Finalized,
}

/// Which halves of the protocol a call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreOnly,
    PostOnly,
    Both,
}

impl Phase {
    pub fn runs_pre(self) -> bool {
        matches!(self, Phase::PreOnly | Phase::Both)
    }

    pub fn runs_post(self) -> bool {
        matches!(self, Phase::PostOnly | Phase::Both)
    }
}

/// Outcome of a pre phase waiting for its post phase.
pub(crate) enum PendingResult {
    Ready(ExecutionHandle),
    /// Joined the request's batch; the handle arrives at the barrier.
    Batched,
}

pub(crate) struct PendingInvocation {
    pub result: PendingResult,
    /// Parameters after defaults, visible to projection as query params.
    pub params: ParamMap,
}

/// The request's batch from the first pre phase to the last post phase.
pub(crate) struct BatchRun {
    pub expected: usize,
    pub seen: usize,
    pub joined: Vec<InvocationId>,
    pub handle: Option<BatchHandle>,
    pub adapter: Option<Arc<dyn BackendAdapter>>,
    pub executed: bool,
    pub posts_remaining: usize,
}

impl BatchRun {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            seen: 0,
            joined: Vec::new(),
            handle: None,
            adapter: None,
            executed: false,
            posts_remaining: expected,
        }
    }
}

/// Everything that belongs to one inbound request. Query definitions are
/// shared between requests; this is not.
pub struct RequestContext {
    pub user: UserContext,
    pub(crate) pending: HashMap<InvocationId, PendingInvocation>,
    pub(crate) states: HashMap<InvocationId, InvocationState>,
    pub(crate) batch: Option<BatchRun>,
    pub(crate) visibility: HashMap<(String, usize), Arc<VisibleChildren>>,
    pub(crate) exports: ParamMap,
    pub(crate) connections: ConnectionStore,
    pub(crate) boxcar: bool,
    next_seq: u64,
}

impl RequestContext {
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            pending: HashMap::new(),
            states: HashMap::new(),
            batch: None,
            visibility: HashMap::new(),
            exports: ParamMap::new(),
            connections: ConnectionStore::new(),
            boxcar: false,
            next_seq: 0,
        }
    }

    /// A fresh identity at `depth`.
    pub fn next_invocation(&mut self, depth: usize) -> InvocationId {
        self.next_seq += 1;
        InvocationId {
            depth,
            seq: self.next_seq,
        }
    }

    pub fn state_of(&self, id: InvocationId) -> InvocationState {
        self.states
            .get(&id)
            .copied()
            .unwrap_or(InvocationState::Unbound)
    }

    pub(crate) fn set_state(&mut self, id: InvocationId, state: InvocationState) {
        self.states.insert(id, state);
    }

    /// Forget any pre-phase outcome cached under `id`.
    pub(crate) fn reset_slot(&mut self, id: InvocationId) {
        self.pending.remove(&id);
        self.states.remove(&id);
    }

    /// Values exported by earlier statements of a boxcar.
    pub fn exports(&self) -> &ParamMap {
        &self.exports
    }

    pub fn is_boxcar(&self) -> bool {
        self.boxcar
    }

    pub(crate) fn begin_batch(&mut self, expected: usize) {
        self.batch = Some(BatchRun::new(expected));
    }

    /// True while a batch still has invocations to accumulate or stream.
    pub fn mid_batch(&self) -> bool {
        self.batch
            .as_ref()
            .is_some_and(|run| !run.executed || run.posts_remaining > 0)
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("user", &self.user)
            .field("pending", &self.pending.len())
            .field("connections", &self.connections)
            .field("boxcar", &self.boxcar)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_ids_unique() {
        let mut ctx = RequestContext::new(UserContext::anonymous());
        let a = ctx.next_invocation(0);
        let b = ctx.next_invocation(1);
        let c = ctx.next_invocation(1);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(c.depth, 1);
        assert_eq!(ctx.state_of(c), InvocationState::Unbound);
    }

    #[test]
    fn test_mid_batch_until_posts_drain() {
        let mut ctx = RequestContext::new(UserContext::anonymous());
        assert!(!ctx.mid_batch());
        ctx.begin_batch(2);
        assert!(ctx.mid_batch());
        if let Some(run) = ctx.batch.as_mut() {
            run.executed = true;
            run.posts_remaining = 0;
        }
        assert!(!ctx.mid_batch());
    }

    #[test]
    fn test_user_roles_sorted() {
        let user = UserContext::new("bob").with_roles(["ops", "admin"]);
        let roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        assert_eq!(roles, vec!["admin", "ops"]);
    }
}
