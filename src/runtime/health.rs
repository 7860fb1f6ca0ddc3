//! Periodic store health checks.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::controller::reconciler::Reconciler;

/// Check every loaded store once
pub async fn check_stores(reconciler: &Reconciler) {
    for handle in reconciler.stores() {
        let result = tokio::time::timeout(handle.timeout, handle.client.health_check()).await;
        match result {
            Ok(Ok(())) => {
                debug!("Store {} is healthy", handle.name);
                reconciler.set_store_health(&handle.name, true, None);
            }
            Ok(Err(e)) => {
                warn!("Store {} health check failed: {}", handle.name, e);
                reconciler.set_store_health(&handle.name, false, Some(e.to_string()));
            }
            Err(_elapsed) => {
                warn!("Store {} health check timed out", handle.name);
                reconciler.set_store_health(
                    &handle.name,
                    false,
                    Some(format!("health check exceeded {}s", handle.timeout.as_secs())),
                );
            }
        }
    }
}

pub async fn run_health_checks(reconciler: Arc<Reconciler>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        check_stores(&reconciler).await;
    }
}
