use uuid::Uuid;

use crate::types::JobStatus;

/// Errors surfaced by the storage adapter, wrapped so the engine never has
/// to match on a raw `sqlx::Error` directly. Mirrors the shape of
/// `cyclotron_core::error::QueueError` but against two backends instead of
/// sharded Postgres.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{operation} failed: {source}")]
    Sql {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} failed: could not acquire a pooled connection: {source}")]
    Pool {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Error kinds surfaced by the queue engine. See SPEC_FULL.md §7.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no outstanding jobs")]
    NoOutstandingJobs,

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("concurrent transaction conflict")]
    ConcurrentTransaction,

    #[error("illegal transition for job {job_id}: current status is {current:?}")]
    IllegalTransition { job_id: Uuid, current: JobStatus },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} on job {job_id:?} failed: {source}")]
    Context {
        operation: &'static str,
        job_id: Option<Uuid>,
        #[source]
        source: Box<QueueError>,
    },
}

impl QueueError {
    /// Wraps `self` with the name of the failing engine operation and the
    /// record id, when known, without discarding the original kind -
    /// callers that need to branch on the kind should match on
    /// `QueueError::kind()` rather than the outer `Context` wrapper.
    pub fn with_context(self, operation: &'static str, job_id: Option<Uuid>) -> Self {
        match self {
            // Don't double-wrap; just refresh the context closest to the caller.
            QueueError::Context { source, .. } => QueueError::Context {
                operation,
                job_id,
                source,
            },
            other => QueueError::Context {
                operation,
                job_id,
                source: Box::new(other),
            },
        }
    }

    /// The innermost, semantically meaningful error kind, unwrapping any
    /// `Context` layers. Used by the dispatch façade's status-code mapping
    /// and by the engine's own retry-on-conflict check.
    pub fn kind(&self) -> &QueueError {
        match self {
            QueueError::Context { source, .. } => source.kind(),
            other => other,
        }
    }

    pub fn is_concurrent_transaction(&self) -> bool {
        matches!(self.kind(), QueueError::ConcurrentTransaction)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
