// Periodic expiry of distributed transaction branches.
use mira_kernel::Kernel;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Dooms expired branches every `interval` until the kernel stops.
///
/// A zero interval disables sweeping; branches then only time out when
/// a prepare, commit or rollback touches them.
pub async fn run_dtx_sweeper(kernel: Arc<Kernel>, interval: Duration) {
    if interval.is_zero() {
        tracing::info!("dtx sweeper disabled");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !kernel.is_running() {
            tracing::debug!("kernel stopped; dtx sweeper exiting");
            return;
        }
        let doomed = kernel.sweep_expired_dtx_branches().await;
        if doomed > 0 {
            tracing::info!(doomed, "expired dtx branches marked rollback-only");
        }
    }
}
