//! Background scan scheduler.
//!
//! Scans once on startup, then again `interval` after each cycle ends, so
//! a slow cycle pushes the next one back instead of stacking up.

use std::sync::Arc;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{ScanError, Scanner};

/// Run the scheduler until `cancel` fires.
pub async fn run_scheduler(scanner: Arc<Scanner>, interval: Duration, cancel: CancellationToken) {
    info!(interval_secs = interval.as_secs_f64(), "📡 Scan scheduler starting, initial scan...");

    loop {
        match scanner.scan().await {
            Ok(report) => {
                let stats = scanner.cache().aggregate_stats();
                info!(
                    cycle = %report.cycle_id,
                    total = stats.total,
                    online = stats.online,
                    offline = stats.offline,
                    "Scheduled scan complete"
                );
            }
            Err(ScanError::Cancelled) => break,
            Err(e) => error!("Scheduled scan failed: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(interval) => {}
        }
    }

    info!("Scan scheduler stopped");
}
