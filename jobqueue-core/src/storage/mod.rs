//! The storage adapter: the minimal capability set the engine needs from a
//! backend (SPEC_FULL.md §4.1). Composition over inheritance - the engine
//! holds a `Box<dyn StorageBackend>` and never knows which concrete backend
//! it's talking to.

pub mod postgres;
pub mod sqlite;

use futures::future::BoxFuture;

use crate::error::QueueError;
use crate::types::{JobRecord, Triple};

/// The operations available to a closure running inside a transaction.
/// Every method re-reads or writes through the transaction's own
/// connection, so callers observe their own writes.
pub trait StorageTransaction: Send {
    fn find_by_triple_nonfailed<'a>(
        &'a mut self,
        triple: &'a Triple,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, QueueError>>;

    fn find_by_id<'a>(
        &'a mut self,
        id: uuid::Uuid,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, QueueError>>;

    fn find_oldest_pending<'a>(
        &'a mut self,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, QueueError>>;

    fn insert<'a>(&'a mut self, record: &'a JobRecord) -> BoxFuture<'a, Result<(), QueueError>>;

    fn update<'a>(&'a mut self, record: &'a JobRecord) -> BoxFuture<'a, Result<(), QueueError>>;
}

/// A closure run inside a transaction by `StorageBackend::run_in_transaction`.
pub type TransactionOp<T> =
    Box<dyn for<'c> FnOnce(&'c mut dyn StorageTransaction) -> BoxFuture<'c, Result<T, QueueError>> + Send>;

/// The backend-facing half of the adapter: owns connections/pools and knows
/// how to open and close a transaction. `T` is boxed as `Box<dyn Any>`-free
/// generic via `TransactionOp<T>` so `StorageBackend` stays object-safe
/// (the engine stores it as `Box<dyn StorageBackend>`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Runs `op` inside a serializable transaction. On `Ok`, the
    /// transaction is committed; on `Err`, it is rolled back. If the commit
    /// itself fails due to a conflicting concurrent transaction, the
    /// returned error's kind is `QueueError::ConcurrentTransaction`
    /// regardless of what `op` returned.
    async fn run_in_transaction(&self, op: TransactionOp<JobRecord>) -> Result<JobRecord, QueueError>;

    /// Same as `run_in_transaction`, but for operations that don't return a
    /// record (only `Finish` needs this).
    async fn run_in_transaction_unit(&self, op: TransactionOp<()>) -> Result<(), QueueError>;

    /// Read-only lookup by id, outside any transaction.
    async fn get_by_id(&self, id: uuid::Uuid) -> Result<Option<JobRecord>, QueueError>;

    /// Applies the backend's schema migrations. Called once at startup.
    async fn run_migrations(&self) -> Result<(), QueueError>;

    /// Closes the underlying connection pool. Called once at process
    /// shutdown; corresponds to `Close()` in the language-neutral Engine API
    /// (SPEC_FULL.md §6).
    async fn close(&self);
}
