// Broker service main entry point.
use anyhow::{Context, Result};
use broker::{config, observability, sweeper};
use mira_kernel::Kernel;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("mira-broker")?;

    let config = config::BrokerConfig::from_env_or_yaml()?;
    let kernel = Arc::new(Kernel::start_in_memory(config.kernel.clone()).context("start kernel")?);
    tracing::info!(node_id = %kernel.node_id(), "broker started");

    let listener = TcpListener::bind(config.admin_bind)
        .await
        .with_context(|| format!("bind admin listener {}", config.admin_bind))?;
    tracing::info!(addr = %listener.local_addr()?, "admin listener started");

    let admin_task = {
        let kernel = Arc::clone(&kernel);
        tokio::spawn(async move {
            if let Err(err) = observability::serve_admin(listener, metrics_handle, kernel).await {
                tracing::warn!(error = %err, "admin server exited");
            }
        })
    };
    let sweeper_task = tokio::spawn(sweeper::run_dtx_sweeper(
        Arc::clone(&kernel),
        Duration::from_millis(config.kernel.dtx_sweep_interval_ms),
    ));

    // Block until the shutdown signal, then drain the kernel once nothing else holds it.
    shutdown.await;
    admin_task.abort();
    sweeper_task.abort();
    let _ = admin_task.await;
    let _ = sweeper_task.await;

    match Arc::try_unwrap(kernel) {
        Ok(kernel) => kernel.shutdown().await,
        Err(_) => tracing::warn!("kernel still shared at shutdown; skipping drain"),
    }
    tracing::info!("broker stopped");
    Ok(())
}
