use std::sync::Arc;

use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use jobqueue_core::engine::{Engine, QueueEngine};
use jobqueue_core::storage::postgres::PostgresBackend;
use jobqueue_core::storage::sqlite::SqliteBackend;
use jobqueue_core::storage::StorageBackend;
use jobqueue_dispatch::JobQueueDispatcher;
use jobqueue_proto::v1::job_queue_server::JobQueueServer;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod config;
mod handlers;

use config::{BackendKind, Config};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn build_backend(config: &Config) -> anyhow::Result<Box<dyn StorageBackend>> {
    let backend: Box<dyn StorageBackend> = match config.backend()? {
        BackendKind::Sqlite => {
            let backend = SqliteBackend::connect(&format!("sqlite://{}", config.sqlite_path))
                .await?;
            Box::new(backend)
        }
        BackendKind::Postgres => {
            let backend =
                PostgresBackend::connect(&config.database_url, config.max_pool_connections)
                    .await?;
            Box::new(backend)
        }
    };
    backend.run_migrations().await?;
    Ok(backend)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting jobqueue-server...");

    let config = Config::init_from_env()?;
    let backend = build_backend(&config).await?;
    let engine: Arc<dyn Engine> = Arc::new(QueueEngine::new(backend));

    let metrics_bind = config.metrics_bind();
    let metrics_router = setup_metrics_routes(handlers::add_routes(
        axum::Router::new(),
        engine.clone(),
    ));
    let metrics_task = tokio::spawn(async move { serve(metrics_router, &metrics_bind).await });

    let dispatcher = JobQueueDispatcher::new(engine.clone());
    let grpc_addr = config.grpc_bind().parse()?;
    info!(%grpc_addr, "gRPC listener starting");

    let grpc_task = tonic::transport::Server::builder()
        .add_service(JobQueueServer::new(dispatcher))
        .serve_with_shutdown(grpc_addr, async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl+c");
            info!("Shutdown signal received");
        });

    tokio::select! {
        result = grpc_task => { result?; }
        result = metrics_task => { result??; }
    }

    engine.close().await;
    info!("jobqueue-server shut down");
    Ok(())
}
