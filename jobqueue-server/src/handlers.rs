use std::sync::Arc;

use axum::{routing, Router};
use jobqueue_core::Engine;

/// Health/readiness routes, in `hook-api`'s `handlers/app.rs` style. No
/// background health-loop is warranted here - the core engine itself runs
/// no background task (SPEC_FULL.md §5), so readiness is just "can we reach
/// the storage backend right now".
pub fn add_routes(router: Router, engine: Arc<dyn Engine>) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route(
            "/_readiness",
            routing::get(move || readiness(engine.clone())),
        )
}

async fn index() -> &'static str {
    "jobqueue-server"
}

async fn readiness(engine: Arc<dyn Engine>) -> axum::http::StatusCode {
    // A job id that cannot exist doubles as a connectivity probe: any
    // answer other than a backend error means the pool is reachable.
    match engine.get(uuid::Uuid::nil()).await {
        Ok(_) => axum::http::StatusCode::OK,
        Err(jobqueue_core::QueueError::NotFound(_)) => axum::http::StatusCode::OK,
        Err(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jobqueue_core::fake::FakeEngine;
    use tower::ServiceExt;

    #[tokio::test]
    async fn readiness_reports_ok_against_the_fake_engine() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine::new());
        let app = add_routes(Router::new(), engine);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_readiness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
