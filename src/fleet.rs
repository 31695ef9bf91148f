//! Fleet monitor — joins inventory rows with cached status.
//!
//! This is the surface the HTTP API and the CLI read from. It never probes
//! on its own; fresh results come only from the scanner.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::inventory::{csv, DeviceRow, Inventory, COL_NAME, COL_SERIAL, COL_SITE};
use crate::scanner::{ScanError, Scanner};
use crate::status::{DeviceStatus, StatusCache, StatusFilter};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("SITE not found")]
    SiteNotFound(String),
    #[error("Failed to update inventory: {0:#}")]
    Persist(anyhow::Error),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Per-row counts plus the last commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// An inventory row with its current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetRow {
    #[serde(flatten)]
    pub row: DeviceRow,
    pub status: DeviceStatus,
}

pub struct FleetMonitor {
    inventory: Arc<Inventory>,
    cache: Arc<StatusCache>,
    scanner: Arc<Scanner>,
}

impl FleetMonitor {
    /// `scanner` must commit into `cache`. Registers the inventory's serials
    /// as Unknown so queries before the first cycle see the whole fleet.
    pub fn new(inventory: Arc<Inventory>, cache: Arc<StatusCache>, scanner: Arc<Scanner>) -> Self {
        cache.sync_roster_from(|| inventory.serials());
        Self { inventory, cache, scanner }
    }

    /// Rows without a serial are never probed and always read Offline.
    fn row_status(&self, row: &DeviceRow) -> DeviceStatus {
        if row.serial.is_empty() {
            return DeviceStatus::Offline;
        }
        self.cache.get(&row.serial).map(|e| e.status).unwrap_or(DeviceStatus::Unknown)
    }

    fn rows_with_status(&self) -> Vec<FleetRow> {
        // One snapshot for the whole listing.
        let snapshot = self.cache.snapshot();
        self.inventory
            .rows()
            .into_iter()
            .map(|row| {
                let status = if row.serial.is_empty() {
                    DeviceStatus::Offline
                } else {
                    snapshot.status_of(&row.serial).unwrap_or(DeviceStatus::Unknown)
                };
                FleetRow { row, status }
            })
            .collect()
    }

    pub fn get_stats(&self) -> FleetStats {
        let rows = self.rows_with_status();
        let online = rows.iter().filter(|r| r.status == DeviceStatus::Online).count();
        FleetStats {
            total: rows.len(),
            online,
            offline: rows.len() - online,
            last_updated: self.cache.last_updated(),
        }
    }

    /// Rows in inventory order.
    pub fn list_by_status(&self, filter: StatusFilter) -> Vec<FleetRow> {
        self.rows_with_status().into_iter().filter(|r| filter.matches(r.status)).collect()
    }

    pub fn find_by_site(&self, site: &str) -> Result<FleetRow, FleetError> {
        let row = self
            .inventory
            .find_by_site(site)
            .ok_or_else(|| FleetError::SiteNotFound(site.trim().to_string()))?;
        let status = self.row_status(&row);
        Ok(FleetRow { row, status })
    }

    /// Re-key the device at `site`. Both the old and the new serial read
    /// Unknown until the next cycle commits.
    pub fn update_serial(&self, site: &str, new_serial: &str) -> Result<(), FleetError> {
        let change = self
            .inventory
            .update_serial(site, new_serial)
            .map_err(FleetError::Persist)?
            .ok_or_else(|| FleetError::SiteNotFound(site.trim().to_string()))?;

        for old in &change.old {
            // May already be gone from the roster; nothing to reset then.
            let _ = self.cache.invalidate(old);
        }
        self.cache.sync_roster_from(|| self.inventory.serials());
        if !change.new.is_empty() {
            let _ = self.cache.invalidate(&change.new);
        }

        info!(site = %change.site, new = %change.new, "Site re-keyed, status reset to unknown");
        Ok(())
    }

    /// Wait for a full cycle (joining one already running) and return the
    /// stats it produced.
    pub async fn trigger_refresh(&self) -> Result<FleetStats, FleetError> {
        let report = self.scanner.scan().await?;
        info!(cycle = %report.cycle_id, "Manual refresh complete");
        Ok(self.get_stats())
    }

    /// CSV export in inventory order. Fields are quoted when they need it,
    /// so the export parses back to the same rows.
    pub fn export_csv(&self, filter: StatusFilter) -> String {
        let mut out = format!("{},{},{}\n", COL_SERIAL, COL_SITE, COL_NAME);
        for r in self.list_by_status(filter) {
            out.push_str(&format!(
                "{},{},{}\n",
                csv::quote(&r.row.serial),
                csv::quote(&r.row.site),
                csv::quote(&r.row.display_name)
            ));
        }
        out
    }
}
