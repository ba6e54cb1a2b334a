use super::{DtxError, Result};
use ahash::RandomState;
use hashbrown::HashMap;
use mira_common::ids::SessionId;
use mira_common::{AckData, Message, Xid};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchState {
    Active,
    RollbackOnly,
    Prepared,
    Committed,
    RolledBack,
}

impl BranchState {
    /// Work may still be added, and the branch may still prepare.
    pub fn accepts_work(self) -> bool {
        matches!(self, BranchState::Active | BranchState::RollbackOnly)
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchState::Active => "active",
            BranchState::RollbackOnly => "rollback_only",
            BranchState::Prepared => "prepared",
            BranchState::Committed => "committed",
            BranchState::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Associated,
    Suspended,
}

#[derive(Debug)]
pub(crate) struct BranchInner {
    pub(crate) state: BranchState,
    associations: HashMap<SessionId, AssociationState, RandomState>,
    pub(crate) enqueues: Vec<Message>,
    pub(crate) dequeues: Vec<AckData>,
    timeout: Duration,
    // Deadline is measured from here; reset whenever the timeout changes.
    timeout_base: Instant,
}

impl BranchInner {
    pub(crate) fn has_associated_active_sessions(&self) -> bool {
        self.associations
            .values()
            .any(|state| *state == AssociationState::Associated)
    }

    pub(crate) fn clear_associations(&mut self) {
        self.associations.clear();
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        !self.timeout.is_zero() && now.saturating_duration_since(self.timeout_base) > self.timeout
    }

    pub(crate) fn take_records(&mut self) -> (Vec<Message>, Vec<AckData>) {
        (
            std::mem::take(&mut self.enqueues),
            std::mem::take(&mut self.dequeues),
        )
    }

    pub(crate) fn incorrect_state(&self, xid: &Xid, reason: impl Into<String>) -> DtxError {
        DtxError::IncorrectState {
            xid: xid.clone(),
            state: self.state,
            reason: reason.into(),
        }
    }
}

/// One transaction branch: its state, enlisted sessions and buffered work.
///
/// All mutation goes through an async lock so a prepare that awaits the
/// store cannot interleave with session changes on the same branch.
#[derive(Debug)]
pub struct DtxBranch {
    xid: Xid,
    inner: Mutex<BranchInner>,
}

impl DtxBranch {
    /// A zero `timeout` never expires.
    pub fn new(xid: Xid, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            xid,
            inner: Mutex::new(BranchInner {
                state: BranchState::Active,
                associations: HashMap::with_hasher(RandomState::new()),
                enqueues: Vec::new(),
                dequeues: Vec::new(),
                timeout,
                timeout_base: now,
            }),
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, BranchInner> {
        self.inner.lock().await
    }

    pub async fn state(&self) -> BranchState {
        self.inner.lock().await.state
    }

    pub async fn timeout(&self) -> Duration {
        self.inner.lock().await.timeout
    }

    /// Replace the timeout; the new deadline counts from now.
    pub async fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.inner.lock().await;
        inner.timeout = timeout;
        inner.timeout_base = Instant::now();
    }

    pub async fn expired(&self) -> bool {
        self.inner.lock().await.expired(Instant::now())
    }

    /// Enlist a session. Re-associating a suspended session resumes it.
    pub async fn associate_session(&self, session: SessionId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_live(&mut inner)?;
        inner
            .associations
            .insert(session, AssociationState::Associated);
        Ok(())
    }

    pub async fn disassociate_session(&self, session: SessionId) -> bool {
        self.inner
            .lock()
            .await
            .associations
            .remove(&session)
            .is_some()
    }

    /// Park an associated session; it no longer blocks prepare or commit.
    pub async fn suspend_session(&self, session: SessionId) -> bool {
        self.transition_session(
            session,
            AssociationState::Associated,
            AssociationState::Suspended,
        )
        .await
    }

    pub async fn resume_session(&self, session: SessionId) -> bool {
        self.transition_session(
            session,
            AssociationState::Suspended,
            AssociationState::Associated,
        )
        .await
    }

    async fn transition_session(
        &self,
        session: SessionId,
        from: AssociationState,
        to: AssociationState,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.associations.get_mut(&session) {
            Some(state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    pub async fn association_state(&self, session: SessionId) -> Option<AssociationState> {
        self.inner.lock().await.associations.get(&session).copied()
    }

    pub async fn has_associated_active_sessions(&self) -> bool {
        self.inner.lock().await.has_associated_active_sessions()
    }

    pub async fn clear_associations(&self) {
        self.inner.lock().await.clear_associations();
    }

    /// Buffer work done under this branch until it resolves.
    pub async fn store_records(&self, enqueues: Vec<Message>, dequeues: Vec<AckData>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.check_live(&mut inner)?;
        inner.enqueues.extend(enqueues);
        inner.dequeues.extend(dequeues);
        Ok(())
    }

    /// Doom an active branch. Returns whether the state changed.
    pub async fn mark_rollback_only(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == BranchState::Active {
            inner.state = BranchState::RollbackOnly;
            true
        } else {
            false
        }
    }

    /// Buffered (enqueue, dequeue) counts.
    pub async fn record_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.enqueues.len(), inner.dequeues.len())
    }

    fn check_live(&self, inner: &mut BranchInner) -> Result<()> {
        if inner.expired(Instant::now()) {
            if inner.state == BranchState::Active {
                inner.state = BranchState::RollbackOnly;
            }
            return Err(DtxError::Timeout(self.xid.clone()));
        }
        if !inner.state.accepts_work() {
            return Err(inner.incorrect_state(&self.xid, "branch no longer accepts work"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_common::MessageMetadata;

    fn xid() -> Xid {
        Xid::new(b"gtx".to_vec(), b"b1".to_vec())
    }

    #[tokio::test]
    async fn suspended_sessions_do_not_count_as_active() {
        let branch = DtxBranch::new(xid(), Duration::ZERO);
        let session = SessionId::new();
        branch.associate_session(session).await.expect("associate");
        assert!(branch.has_associated_active_sessions().await);

        assert!(branch.suspend_session(session).await);
        assert!(!branch.has_associated_active_sessions().await);
        assert_eq!(
            branch.association_state(session).await,
            Some(AssociationState::Suspended)
        );

        assert!(branch.resume_session(session).await);
        assert!(branch.has_associated_active_sessions().await);
        assert!(branch.disassociate_session(session).await);
        assert!(!branch.has_associated_active_sessions().await);
    }

    #[tokio::test]
    async fn zero_timeout_never_expires() {
        let branch = DtxBranch::new(xid(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!branch.expired().await);
    }

    #[tokio::test]
    async fn expired_branch_refuses_work_and_becomes_rollback_only() {
        let branch = DtxBranch::new(xid(), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(branch.expired().await);
        let err = branch
            .store_records(vec![Message::new(MessageMetadata::queue("q"))], Vec::new())
            .await
            .expect_err("expired");
        assert_eq!(err, DtxError::Timeout(xid()));
        assert_eq!(branch.state().await, BranchState::RollbackOnly);
        assert_eq!(branch.record_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn set_timeout_rebases_the_deadline() {
        let branch = DtxBranch::new(xid(), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(branch.expired().await);
        branch.set_timeout(Duration::from_secs(60)).await;
        assert!(!branch.expired().await);
        branch
            .store_records(Vec::new(), Vec::new())
            .await
            .expect("accepts work");
    }

    #[tokio::test]
    async fn rollback_only_branch_still_buffers_work() {
        let branch = DtxBranch::new(xid(), Duration::ZERO);
        assert!(branch.mark_rollback_only().await);
        assert!(!branch.mark_rollback_only().await);
        branch
            .store_records(vec![Message::new(MessageMetadata::queue("q"))], Vec::new())
            .await
            .expect("buffered");
        assert_eq!(branch.record_counts().await, (1, 0));
    }
}
