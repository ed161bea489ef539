//! The persistent job-queue engine (SPEC_FULL.md §§1-9): the transactional
//! data model and protocols that preserve its invariants under concurrent
//! enqueue and dequeue from many producers and workers, across the two
//! storage backends in `storage::sqlite` and `storage::postgres`.
//!
//! Collaborators out of this crate's scope - the gRPC transport
//! (`jobqueue-proto`/`jobqueue-dispatch`), configuration loading and the
//! server binary (`jobqueue-server`), the worker's checkout/query-tool
//! invocation, and the blob store - are deliberately absent here.

pub mod engine;
pub mod error;
pub mod metrics_consts;
pub mod storage;
pub mod types;

#[cfg(feature = "testkit")]
pub mod fake;

pub use engine::{Engine, QueueEngine};
pub use error::{BackendError, QueueError, Result};
pub use types::{EnqueueRequest, JobRecord, JobStatus, TerminalStatus, Triple};
