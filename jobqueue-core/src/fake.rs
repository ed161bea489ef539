//! In-memory test double (SPEC_FULL.md §4.4): a FIFO list of pending
//! records with no durability and no concurrency control, satisfying the
//! `Engine` trait so dispatch-façade tests don't need a real backend.
//!
//! It intentionally does *not* implement the deduplication invariant (I2)
//! or the status-transition checks (I3) - its job is mocking the happy path
//! and letting tests inject specific error kinds, not fidelity to the real
//! engine's invariants. Use `QueueEngine` against a real backend to test
//! those.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::QueueError;
use crate::types::{EnqueueRequest, JobRecord, JobStatus, TerminalStatus, Triple};

#[derive(Default)]
struct FakeState {
    records: HashMap<Uuid, JobRecord>,
    pending_order: VecDeque<Uuid>,
    next_enqueue_error: Option<QueueError>,
    next_dequeue_error: Option<QueueError>,
    next_get_error: Option<QueueError>,
    next_finish_error: Option<QueueError>,
}

/// A non-transactional stand-in for `QueueEngine`. Every method is
/// `&self` (not `&mut self`) like the real `Engine` trait, backed by a
/// `std::sync::Mutex` rather than the storage adapter's transactions.
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        FakeEngine {
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Makes the next call to `enqueue` return `err` instead of doing
    /// anything, so dispatch-façade tests can exercise error-code mapping
    /// without a real backend to provoke the error from.
    pub fn inject_enqueue_error(&self, err: QueueError) {
        self.state.lock().unwrap().next_enqueue_error = Some(err);
    }

    pub fn inject_dequeue_error(&self, err: QueueError) {
        self.state.lock().unwrap().next_dequeue_error = Some(err);
    }

    pub fn inject_get_error(&self, err: QueueError) {
        self.state.lock().unwrap().next_get_error = Some(err);
    }

    pub fn inject_finish_error(&self, err: QueueError) {
        self.state.lock().unwrap().next_finish_error = Some(err);
    }

    /// Seeds a PENDING record directly, bypassing `enqueue`, for tests that
    /// want to start from a populated queue.
    pub fn seed_pending(&self, triple: Triple) -> JobRecord {
        let record = JobRecord::new_pending(triple, Utc::now());
        let mut state = self.state.lock().unwrap();
        state.pending_order.push_back(record.id);
        state.records.insert(record.id, record.clone());
        record
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<JobRecord, QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.next_enqueue_error.take() {
            return Err(err);
        }

        let triple = Triple {
            repository: req.repository,
            commit: req.commit,
            query: req.query,
        };
        let record = JobRecord::new_pending(triple, Utc::now());
        state.pending_order.push_back(record.id);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn dequeue(&self, worker: String) -> Result<JobRecord, QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.next_dequeue_error.take() {
            return Err(err);
        }

        let Some(id) = state.pending_order.pop_front() else {
            return Err(QueueError::NoOutstandingJobs);
        };

        let record = state.records.get_mut(&id).expect("pending_order/records out of sync");
        record.status = JobStatus::Running;
        record.worker = Some(worker);
        record.start_time = Some(Utc::now());
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> Result<JobRecord, QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.next_get_error.take() {
            return Err(err);
        }
        state.records.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    async fn finish(
        &self,
        id: Uuid,
        terminal: TerminalStatus,
        result: String,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.next_finish_error.take() {
            return Err(err);
        }

        let record = state.records.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        record.finish_time = Some(Utc::now());
        record.status = terminal.into();
        match terminal {
            TerminalStatus::Succeeded => record.result_url = Some(result),
            TerminalStatus::Failed => record.result_error = Some(result),
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn honors_injected_errors_exactly_once() {
        let fake = FakeEngine::new();
        fake.inject_get_error(QueueError::NotFound(Uuid::nil()));

        let err = fake.get(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));

        // Second call after seeding should succeed - the injected error is
        // consumed, not sticky.
        let seeded = fake.seed_pending(Triple {
            repository: "A".into(),
            commit: "X".into(),
            query: "Q".into(),
        });
        let fetched = fake.get(seeded.id).await.unwrap();
        assert_eq!(fetched.id, seeded.id);
    }

    #[tokio::test]
    async fn fifo_dequeue_order_and_no_dedup() {
        let fake = FakeEngine::new();
        let req = |q: &str| EnqueueRequest {
            repository: "A".into(),
            commit: "X".into(),
            query: q.into(),
        };

        let first = fake.enqueue(req("one")).await.unwrap();
        let second = fake.enqueue(req("one")).await.unwrap();
        // Unlike the real engine, the fake does not deduplicate.
        assert_ne!(first.id, second.id);

        let dequeued_first = fake.dequeue("w1".into()).await.unwrap();
        assert_eq!(dequeued_first.id, first.id);
    }
}
