use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use image_job_pipeline::app_state::AppState;
use image_job_pipeline::config::AppConfig;
use image_job_pipeline::routes;
use image_job_pipeline::services::{
    job_store::{JobStore, RedisJobStore},
    processors::ProcessorRegistry,
    queue::{JobPublisher, QueueConfig},
    redis_queue::RedisStreamQueue,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing image-job-pipeline server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("image_jobs_submitted_total", "Total image jobs accepted");
    metrics::describe_counter!("image_jobs_completed_total", "Total image jobs completed");
    metrics::describe_counter!(
        "image_jobs_failed_total",
        "Total image jobs marked failed"
    );
    metrics::describe_counter!(
        "image_jobs_dead_lettered_total",
        "Total queue messages moved to the dead-letter stream"
    );
    metrics::describe_histogram!(
        "image_job_processing_seconds",
        "Time from delivery to completion of an image job"
    );

    tracing::info!(prefix = %config.job_key_prefix, "Connecting to Redis job store");
    let store = RedisJobStore::connect(
        &config.redis_url,
        config.job_key_prefix.clone(),
        config.job_ttl_secs,
    )
    .await
    .expect("Failed to connect to job store");
    let store: Arc<dyn JobStore> = Arc::new(store);

    let queue_config = QueueConfig::from_app_config(&config);
    tracing::info!(stream = %queue_config.stream_key(), "Connecting to Redis job queue");
    let queue = RedisStreamQueue::connect(queue_config)
        .await
        .expect("Failed to initialize job queue");
    let publisher: Arc<dyn JobPublisher> = Arc::new(queue);

    let registry = Arc::new(ProcessorRegistry::with_defaults());
    tracing::info!(processors = ?registry.list(), "Processor registry ready");

    let state = AppState::new(store.clone(), publisher.clone(), registry);

    let app = Router::new()
        .merge(routes::api_router(state))
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(routes::transform::MAX_UPLOAD_BYTES))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down, releasing connections");
    if let Err(e) = publisher.close().await {
        tracing::warn!(error = %e, "Failed to close job queue");
    }
    if let Err(e) = store.close().await {
        tracing::warn!(error = %e, "Failed to close job store");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
