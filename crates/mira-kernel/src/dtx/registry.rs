use super::branch::{BranchInner, BranchState, DtxBranch};
use super::{DtxError, Result};
use ahash::RandomState;
use hashbrown::HashMap;
use mira_common::Xid;
use mira_storage::{MessageStore, PreparedRecords};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

type BranchMap = HashMap<Xid, Arc<DtxBranch>, RandomState>;

/// Live transaction branches by xid.
///
/// Structural operations hold the map lock for their whole duration, then the
/// branch lock, always in that order.
pub struct DtxRegistry {
    branches: Mutex<BranchMap>,
    store: Arc<dyn MessageStore>,
    default_timeout: Duration,
}

impl DtxRegistry {
    pub fn new(store: Arc<dyn MessageStore>, default_timeout: Duration) -> Self {
        Self {
            branches: Mutex::new(HashMap::with_hasher(RandomState::new())),
            store,
            default_timeout,
        }
    }

    /// Register `branch` unless its xid is already taken.
    pub async fn register_branch(&self, branch: Arc<DtxBranch>) -> bool {
        let mut branches = self.branches.lock().await;
        if branches.contains_key(branch.xid()) {
            return false;
        }
        tracing::debug!(xid = %branch.xid(), "registered dtx branch");
        branches.insert(branch.xid().clone(), branch);
        metrics::gauge!("mira_dtx_branches").set(branches.len() as f64);
        true
    }

    /// Create and register a branch with the default timeout.
    pub async fn create_branch(&self, xid: Xid) -> Option<Arc<DtxBranch>> {
        let branch = Arc::new(DtxBranch::new(xid, self.default_timeout));
        self.register_branch(Arc::clone(&branch))
            .await
            .then_some(branch)
    }

    /// Remove `branch` if it is the instance registered under its xid.
    pub async fn unregister_branch(&self, branch: &Arc<DtxBranch>) -> bool {
        let mut branches = self.branches.lock().await;
        match branches.get(branch.xid()) {
            Some(registered) if Arc::ptr_eq(registered, branch) => {
                remove(&mut branches, branch.xid());
                true
            }
            _ => false,
        }
    }

    pub async fn get_branch(&self, xid: &Xid) -> Option<Arc<DtxBranch>> {
        self.branches.lock().await.get(xid).cloned()
    }

    pub async fn branch_count(&self) -> usize {
        self.branches.lock().await.len()
    }

    /// First phase: persist the branch's work so commit can no longer fail
    /// for lack of it.
    pub async fn prepare(&self, xid: &Xid) -> Result<()> {
        let mut branches = self.branches.lock().await;
        let branch = lookup(&branches, xid)?;
        let mut inner = branch.lock().await;
        self.check_resolvable(&mut branches, &mut inner, xid)?;
        if !inner.state.accepts_work() {
            return Err(inner.incorrect_state(
                xid,
                format!("cannot prepare a transaction in state {}", inner.state),
            ));
        }
        self.store
            .store_dtx_records(xid, &inner.enqueues, &inner.dequeues)
            .await
            .map_err(|source| DtxError::Store {
                xid: xid.clone(),
                source,
            })?;
        inner.state = BranchState::Prepared;
        tracing::debug!(
            xid = %xid,
            enqueues = inner.enqueues.len(),
            dequeues = inner.dequeues.len(),
            "dtx branch prepared"
        );
        Ok(())
    }

    /// Resolve the branch as committed. One-phase commit skips prepare and
    /// requires an active branch; two-phase requires a prepared one.
    ///
    /// `apply` receives a copy of the branch's work and must make it durable.
    /// Both locks are held until it finishes: only on success does the branch
    /// become `Committed` and leave the registry. On failure the branch keeps
    /// its state and records, so it can be committed again or rolled back.
    pub async fn commit<F, Fut, E>(
        &self,
        xid: &Xid,
        one_phase: bool,
        apply: F,
    ) -> std::result::Result<(), E>
    where
        F: FnOnce(PreparedRecords) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: From<DtxError>,
    {
        let mut branches = self.branches.lock().await;
        let branch = lookup(&branches, xid)?;
        let mut inner = branch.lock().await;
        self.check_resolvable(&mut branches, &mut inner, xid)?;
        match (one_phase, inner.state) {
            (true, BranchState::Active) | (false, BranchState::Prepared) => {}
            (true, BranchState::RollbackOnly) => {
                inner.state = BranchState::RolledBack;
                inner.take_records();
                remove(&mut branches, xid);
                tracing::info!(xid = %xid, "rolled back rollback-only branch on commit");
                return Err(DtxError::RollbackOnly(xid.clone()).into());
            }
            (_, state) => {
                let reason = if one_phase {
                    format!("cannot one-phase commit a transaction in state {state}")
                } else {
                    format!("cannot commit a transaction in state {state}")
                };
                return Err(inner.incorrect_state(xid, reason).into());
            }
        }
        let records = PreparedRecords {
            enqueues: inner.enqueues.clone(),
            dequeues: inner.dequeues.clone(),
        };
        if let Err(err) = apply(records).await {
            tracing::warn!(
                xid = %xid,
                one_phase,
                state = %inner.state,
                "dtx commit not applied, branch kept"
            );
            return Err(err);
        }
        inner.state = BranchState::Committed;
        inner.take_records();
        remove(&mut branches, xid);
        tracing::debug!(xid = %xid, one_phase, "dtx branch committed");
        Ok(())
    }

    /// Discard the branch's work. A branch that had expired is still rolled
    /// back but reported as timed out.
    pub async fn rollback(&self, xid: &Xid) -> Result<()> {
        let mut branches = self.branches.lock().await;
        let branch = lookup(&branches, xid)?;
        let mut inner = branch.lock().await;
        if inner.has_associated_active_sessions() {
            return Err(inner.incorrect_state(xid, "branch still has associated sessions"));
        }
        inner.clear_associations();
        let timed_out = inner.expired(Instant::now());
        match inner.state {
            BranchState::Active | BranchState::RollbackOnly => {}
            BranchState::Prepared => {
                self.store
                    .rollback_dtx(xid)
                    .await
                    .map_err(|source| DtxError::Store {
                        xid: xid.clone(),
                        source,
                    })?;
            }
            state => {
                return Err(inner.incorrect_state(
                    xid,
                    format!("cannot roll back a transaction in state {state}"),
                ));
            }
        }
        inner.state = BranchState::RolledBack;
        inner.take_records();
        remove(&mut branches, xid);
        if timed_out {
            metrics::counter!("mira_dtx_timeouts_total").increment(1);
            tracing::warn!(xid = %xid, "rolled back timed out dtx branch");
            return Err(DtxError::Timeout(xid.clone()));
        }
        tracing::debug!(xid = %xid, "dtx branch rolled back");
        Ok(())
    }

    /// Drop all knowledge of a branch, discarding any prepared record.
    pub async fn forget(&self, xid: &Xid) -> Result<()> {
        let mut branches = self.branches.lock().await;
        let branch = lookup(&branches, xid)?;
        let mut inner = branch.lock().await;
        if inner.has_associated_active_sessions() {
            return Err(inner.incorrect_state(xid, "branch still has associated sessions"));
        }
        if inner.state == BranchState::Prepared {
            self.store
                .rollback_dtx(xid)
                .await
                .map_err(|source| DtxError::Store {
                    xid: xid.clone(),
                    source,
                })?;
        }
        inner.clear_associations();
        inner.take_records();
        remove(&mut branches, xid);
        tracing::debug!(xid = %xid, state = %inner.state, "dtx branch forgotten");
        Ok(())
    }

    /// Mark every expired active branch rollback-only. Returns how many changed.
    pub async fn sweep_expired(&self) -> usize {
        let branches = self.branches.lock().await;
        let now = Instant::now();
        let mut doomed = 0;
        for branch in branches.values() {
            let mut inner = branch.lock().await;
            if inner.state == BranchState::Active && inner.expired(now) {
                inner.state = BranchState::RollbackOnly;
                doomed += 1;
                metrics::counter!("mira_dtx_timeouts_total").increment(1);
                tracing::warn!(xid = %branch.xid(), "dtx branch timed out, marked rollback only");
            }
        }
        doomed
    }

    // Shared gate for prepare and commit: no active sessions, not expired.
    fn check_resolvable(
        &self,
        branches: &mut BranchMap,
        inner: &mut BranchInner,
        xid: &Xid,
    ) -> Result<()> {
        if inner.has_associated_active_sessions() {
            return Err(inner.incorrect_state(xid, "branch still has associated sessions"));
        }
        inner.clear_associations();
        if inner.expired(Instant::now()) {
            remove(branches, xid);
            metrics::counter!("mira_dtx_timeouts_total").increment(1);
            tracing::warn!(xid = %xid, "dtx branch timed out");
            return Err(DtxError::Timeout(xid.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DtxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxRegistry")
            .field("default_timeout", &self.default_timeout)
            .field("store", &self.store.backend_name())
            .finish()
    }
}

fn lookup(branches: &BranchMap, xid: &Xid) -> Result<Arc<DtxBranch>> {
    branches
        .get(xid)
        .cloned()
        .ok_or_else(|| DtxError::UnknownBranch(xid.clone()))
}

fn remove(branches: &mut BranchMap, xid: &Xid) {
    if branches.remove(xid).is_some() {
        metrics::gauge!("mira_dtx_branches").set(branches.len() as f64);
    }
}
