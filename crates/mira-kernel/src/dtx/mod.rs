// Distributed (XA) transaction branches.
use mira_common::Xid;
use mira_storage::StorageError;

pub mod branch;
pub mod registry;

pub use branch::{AssociationState, BranchState, DtxBranch};
pub use registry::DtxRegistry;

pub type Result<T> = std::result::Result<T, DtxError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DtxError {
    #[error("unknown dtx branch {0}")]
    UnknownBranch(Xid),
    #[error("dtx branch {xid} is {state}: {reason}")]
    IncorrectState {
        xid: Xid,
        state: BranchState,
        reason: String,
    },
    #[error("dtx branch {0} timed out")]
    Timeout(Xid),
    #[error("dtx branch {0} is rollback only and was rolled back")]
    RollbackOnly(Xid),
    #[error("dtx store failure for {xid}: {source}")]
    Store {
        xid: Xid,
        #[source]
        source: StorageError,
    },
}

impl DtxError {
    pub fn xid(&self) -> &Xid {
        match self {
            DtxError::UnknownBranch(xid)
            | DtxError::Timeout(xid)
            | DtxError::RollbackOnly(xid)
            | DtxError::IncorrectState { xid, .. }
            | DtxError::Store { xid, .. } => xid,
        }
    }
}
