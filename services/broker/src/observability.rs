//! Tracing and metrics setup for the broker service, plus the admin HTTP surface.
//!
//! The admin router exposes `/metrics` (Prometheus text), `/live`, `/ready`
//! and `/cluster`. Readiness reflects the kernel: the pipeline must still be
//! running and the message store must report healthy.
//! Both the recorder and the subscriber are process-global, so repeated
//! initialization (tests, embedded use) reuses what is already installed.

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use mira_kernel::Kernel;
use mira_storage::MessageStore as _;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the tracing subscriber and the Prometheus recorder.
///
/// Log filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));

    let handle = install_metrics_recorder()?;
    tracing::info!(service = %service_name, "observability initialized");
    Ok(handle)
}

pub fn admin_router(handle: PrometheusHandle, kernel: Arc<Kernel>) -> Router {
    let ready_kernel = Arc::clone(&kernel);
    Router::new()
        .route(
            "/metrics",
            get(move || async move { handle.render() }),
        )
        .route("/live", get(|| async { "ok" }))
        .route(
            "/ready",
            get(move || {
                let kernel = Arc::clone(&ready_kernel);
                async move { readiness(&kernel).await }
            }),
        )
        .route(
            "/cluster",
            get(move || {
                let kernel = Arc::clone(&kernel);
                async move { Json(kernel.cluster_information().await) }
            }),
        )
}

async fn readiness(kernel: &Kernel) -> impl IntoResponse + use<> {
    if !kernel.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "pipeline stopped");
    }
    if !kernel.store().is_healthy().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "store unhealthy");
    }
    (StatusCode::OK, "ok")
}

/// Serves the admin router until the listener fails or the task is aborted.
pub async fn serve_admin(
    listener: TcpListener,
    handle: PrometheusHandle,
    kernel: Arc<Kernel>,
) -> std::io::Result<()> {
    let app = admin_router(handle, kernel);
    axum::serve(listener, app.into_make_service()).await
}

// The recorder is process-global; later calls reuse the first handle.
fn install_metrics_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    if subscriber.try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
