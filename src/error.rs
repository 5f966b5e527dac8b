//! Crate-level error wrapper.
//!
//! Thin over the per-subsystem errors; callers who want detail match on
//! the transparent variants.

use thiserror::Error;

use crate::db::DbError;
use crate::engine::EngineError;
use crate::engine::bootstrap::BootstrapError;
use crate::engine::entries::StoreError;
use crate::engine::filter::FilterError;
use crate::engine::milestone::MilestoneError;
use crate::engine::replication::ReplicationError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Milestone(#[from] MilestoneError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl Error {
    /// Whether retrying the operation may succeed without changing
    /// inputs or state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Db(err) => db_retryable(err),
            Error::Store(err) => match err {
                StoreError::MissingChunk { .. } => true,
                StoreError::RemoteUnavailable(_) => true,
                StoreError::NotReady => false,
                StoreError::LeafWriteRejected { .. } => false,
                StoreError::NotANote { .. } => false,
                StoreError::Db(err) => db_retryable(err),
            },
            Error::Replication(err) => match err {
                ReplicationError::Busy => true,
                ReplicationError::Connect(_) => true,
                ReplicationError::Inhibited => false,
                ReplicationError::RemoteSchema => false,
                ReplicationError::NotReady => false,
                ReplicationError::Milestone(_) => false,
                ReplicationError::Db(err) => db_retryable(err),
            },
            Error::Milestone(err) => matches!(err, MilestoneError::Connect(_)),
            Error::Bootstrap(_) => false,
            Error::Filter(_) => false,
            Error::Engine(_) => false,
        }
    }
}

fn db_retryable(err: &DbError) -> bool {
    match err {
        DbError::Conflict { .. } => true,
        DbError::Status { status, .. } => *status == 429 || *status >= 500,
        DbError::NotFound { .. } => false,
        DbError::Closed => false,
        DbError::Backend(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_server_errors_are_retryable() {
        assert!(
            Error::from(DbError::Conflict {
                id: "a".to_string()
            })
            .is_retryable()
        );
        assert!(
            Error::from(DbError::Status {
                status: 503,
                reason: "overloaded".to_string()
            })
            .is_retryable()
        );
        assert!(!Error::from(DbError::not_found("a")).is_retryable());
    }

    #[test]
    fn busy_replication_is_retryable_but_locks_are_not() {
        assert!(Error::from(ReplicationError::Busy).is_retryable());
        assert!(!Error::from(MilestoneError::RemoteLocked).is_retryable());
    }
}
