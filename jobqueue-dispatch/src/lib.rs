//! The dispatch façade (SPEC_FULL.md §4.3): translates the gRPC
//! request/response messages generated by `jobqueue-proto` into calls
//! against an `Arc<dyn jobqueue_core::Engine>`, attaches poll-time hints,
//! and maps engine error kinds to transport failure codes (§7).
//!
//! This crate carries no business logic of its own - every decision here is
//! either a direct translation of an engine call/response, or one of the
//! two poll-hint constants named in the spec.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobqueue_core::{Engine, EnqueueRequest, JobRecord, JobStatus, QueueError, TerminalStatus};
use tonic::{Request, Response, Status};
use tracing::instrument;
use uuid::Uuid;

use jobqueue_proto::v1::job_queue_server::JobQueue;
use jobqueue_proto::v1::{
    finish_query_job_request, poll_response, Failure, FinishQueryJobRequest,
    FinishQueryJobResponse, GetQueryJobRequest, GetQueryJobResponse, InProgress, PollRequest,
    PollResponse, QueryJob, QueueRequest, QueueResponse, SourceRef, Success,
};

/// +10s from now, per SPEC_FULL.md §4.3's "GetQueryJob" poll hint.
const GET_QUERY_JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// +5s from now, per SPEC_FULL.md §4.3's "Poll" in-progress hint.
const POLL_IN_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub struct JobQueueDispatcher {
    engine: Arc<dyn Engine>,
}

impl JobQueueDispatcher {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        JobQueueDispatcher { engine }
    }
}

fn to_timestamp(dt: chrono::DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

fn poll_hint(after: Duration) -> prost_types::Timestamp {
    to_timestamp(Utc::now() + after)
}

fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument(format!("invalid job id: {raw}")))
}

/// Maps an engine error kind to the transport failure code table in
/// SPEC_FULL.md §7. `NoOutstandingJobs` is handled by callers directly (it
/// is not an RPC error at all for `GetQueryJob`), so it is not expected to
/// reach here in practice, but falls through to `internal` if it ever does.
fn queue_error_to_status(err: &QueueError) -> Status {
    match err.kind() {
        QueueError::NotFound(id) => Status::not_found(format!("job {id} not found")),
        QueueError::IllegalTransition { job_id, current } => Status::failed_precondition(
            format!("job {job_id} is {current:?}, cannot transition from there"),
        ),
        QueueError::Validation(msg) => Status::invalid_argument(msg.clone()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl JobQueue for JobQueueDispatcher {
    #[instrument(skip(self, request))]
    async fn queue(
        &self,
        request: Request<QueueRequest>,
    ) -> Result<Response<QueueResponse>, Status> {
        let req = request.into_inner();
        let record = self
            .engine
            .enqueue(EnqueueRequest {
                repository: req.repository,
                commit: req.commit_hash,
                query: req.query_string,
            })
            .await
            .map_err(|e| queue_error_to_status(&e))?;

        Ok(Response::new(QueueResponse {
            id: record.id.to_string(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn poll(&self, request: Request<PollRequest>) -> Result<Response<PollResponse>, Status> {
        let req = request.into_inner();
        let id = parse_job_id(&req.id)?;

        let record = self
            .engine
            .get(id)
            .await
            .map_err(|e| queue_error_to_status(&e))?;

        let status = poll_status_for(&record)?;

        Ok(Response::new(PollResponse {
            id: record.id.to_string(),
            status: Some(status),
        }))
    }

    #[instrument(skip(self, request))]
    async fn get_query_job(
        &self,
        request: Request<GetQueryJobRequest>,
    ) -> Result<Response<GetQueryJobResponse>, Status> {
        let req = request.into_inner();

        match self.engine.dequeue(req.worker_name).await {
            Ok(record) => Ok(Response::new(GetQueryJobResponse {
                next_poll_time: Some(poll_hint(GET_QUERY_JOB_POLL_INTERVAL)),
                job: Some(QueryJob {
                    id: record.id.to_string(),
                    query: record.query,
                    source: Some(SourceRef {
                        repository: record.repository,
                        committish: record.commit,
                    }),
                }),
            })),
            // Not an RPC error - an empty response with a retry hint,
            // per SPEC_FULL.md §4.3.
            Err(QueueError::NoOutstandingJobs) => Ok(Response::new(GetQueryJobResponse {
                next_poll_time: Some(poll_hint(GET_QUERY_JOB_POLL_INTERVAL)),
                job: None,
            })),
            Err(e) => Err(queue_error_to_status(&e)),
        }
    }

    #[instrument(skip(self, request))]
    async fn finish_query_job(
        &self,
        request: Request<FinishQueryJobRequest>,
    ) -> Result<Response<FinishQueryJobResponse>, Status> {
        let req = request.into_inner();
        let id = parse_job_id(&req.query_job_id)?;

        let (terminal, result) = match req.result {
            Some(finish_query_job_request::Result::GcsLocation(url)) => {
                (TerminalStatus::Succeeded, url)
            }
            Some(finish_query_job_request::Result::FailureMessage(message)) => {
                (TerminalStatus::Failed, message)
            }
            None => {
                // No terminal status was deducible from the oneof -
                // SPEC_FULL.md §7's `Validation` kind, routed through the
                // same mapping table as every other engine error.
                return Err(queue_error_to_status(&QueueError::Validation(
                    "finish_query_job result must set gcs_location or failure_message".into(),
                )));
            }
        };

        self.engine
            .finish(id, terminal, result)
            .await
            .map_err(|e| queue_error_to_status(&e))?;

        Ok(Response::new(FinishQueryJobResponse {}))
    }
}

/// §4.3: maps a record's status to the oneof `PollResponse` expects. A
/// terminal status missing its required payload field is a protocol
/// violation in the storage layer, not a client-facing `NotFound` - it
/// surfaces as `failed-precondition` per the §7 mapping table.
fn poll_status_for(record: &JobRecord) -> Result<poll_response::Status, Status> {
    match record.status {
        JobStatus::Pending | JobStatus::Running => {
            Ok(poll_response::Status::InProgress(InProgress {
                next_poll_time: Some(poll_hint(POLL_IN_PROGRESS_INTERVAL)),
            }))
        }
        JobStatus::Succeeded => {
            let results_url = record.result_url.clone().ok_or_else(|| {
                Status::failed_precondition(format!(
                    "job {} is SUCCEEDED but has no result_url",
                    record.id
                ))
            })?;
            Ok(poll_response::Status::Success(Success { results_url }))
        }
        JobStatus::Failed => {
            let failure_message = record.result_error.clone().ok_or_else(|| {
                Status::failed_precondition(format!(
                    "job {} is FAILED but has no result_error",
                    record.id
                ))
            })?;
            Ok(poll_response::Status::Failure(Failure { failure_message }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue_core::fake::FakeEngine;
    use jobqueue_proto::v1::FinishQueryJobRequest as FinishReq;

    fn dispatcher() -> (Arc<FakeEngine>, JobQueueDispatcher) {
        let fake = Arc::new(FakeEngine::new());
        let dispatcher = JobQueueDispatcher::new(fake.clone());
        (fake, dispatcher)
    }

    #[tokio::test]
    async fn queue_then_poll_in_progress() {
        let (_fake, dispatcher) = dispatcher();

        let queued = dispatcher
            .queue(Request::new(QueueRequest {
                repository: "A".into(),
                commit_hash: "X".into(),
                query_string: "Q".into(),
            }))
            .await
            .unwrap()
            .into_inner();

        let polled = dispatcher
            .poll(Request::new(PollRequest { id: queued.id }))
            .await
            .unwrap()
            .into_inner();

        assert!(matches!(polled.status, Some(poll_response::Status::InProgress(_))));
    }

    #[tokio::test]
    async fn empty_queue_is_not_an_rpc_error() {
        let (_fake, dispatcher) = dispatcher();

        let resp = dispatcher
            .get_query_job(Request::new(GetQueryJobRequest {
                worker_name: "w1".into(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(resp.job.is_none());
        assert!(resp.next_poll_time.is_some());
    }

    #[tokio::test]
    async fn poll_unknown_id_maps_to_not_found() {
        let (_fake, dispatcher) = dispatcher();

        let err = dispatcher
            .poll(Request::new(PollRequest {
                id: Uuid::new_v4().to_string(),
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn finish_without_result_variant_is_invalid_argument() {
        let (fake, dispatcher) = dispatcher();
        let seeded = fake.seed_pending(jobqueue_core::Triple {
            repository: "A".into(),
            commit: "X".into(),
            query: "Q".into(),
        });
        fake.dequeue("w1".into()).await.unwrap();

        let err = dispatcher
            .finish_query_job(Request::new(FinishReq {
                query_job_id: seeded.id.to_string(),
                result: None,
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn finish_success_then_poll_success() {
        let (fake, dispatcher) = dispatcher();
        let seeded = fake.seed_pending(jobqueue_core::Triple {
            repository: "A".into(),
            commit: "X".into(),
            query: "Q".into(),
        });
        fake.dequeue("w1".into()).await.unwrap();

        dispatcher
            .finish_query_job(Request::new(FinishReq {
                query_job_id: seeded.id.to_string(),
                result: Some(finish_query_job_request::Result::GcsLocation(
                    "gs://b/o.pb".into(),
                )),
            }))
            .await
            .unwrap();

        let polled = dispatcher
            .poll(Request::new(PollRequest {
                id: seeded.id.to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        match polled.status {
            Some(poll_response::Status::Success(Success { results_url })) => {
                assert_eq!(results_url, "gs://b/o.pb");
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn illegal_transition_maps_to_failed_precondition() {
        let (fake, dispatcher) = dispatcher();
        fake.inject_finish_error(QueueError::IllegalTransition {
            job_id: Uuid::nil(),
            current: JobStatus::Succeeded,
        });

        let err = dispatcher
            .finish_query_job(Request::new(FinishReq {
                query_job_id: Uuid::nil().to_string(),
                result: Some(finish_query_job_request::Result::FailureMessage(
                    "boom".into(),
                )),
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }
}
