//! Fleet inventory — which devices exist, at which site, under which name.
//!
//! Loaded from a CSV file with the columns `P2P NUMBER`, `SITE` and
//! `STORE NAME`. Row order is the fleet order used everywhere else.
//! Serial changes are written back to the file atomically.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub mod csv;

pub const COL_SERIAL: &str = "P2P NUMBER";
pub const COL_SITE: &str = "SITE";
pub const COL_NAME: &str = "STORE NAME";

/// One inventory row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRow {
    #[serde(rename = "P2P NUMBER")]
    pub serial: String,
    #[serde(rename = "SITE")]
    pub site: String,
    #[serde(rename = "STORE NAME")]
    pub display_name: String,
}

/// Result of re-keying the device(s) at a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialChange {
    pub site: String,
    /// Distinct non-empty serials the site's rows had before.
    pub old: Vec<String>,
    pub new: String,
}

pub struct Inventory {
    rows: RwLock<Vec<DeviceRow>>,
    /// Where changes are persisted. `None` keeps the inventory in memory.
    path: Option<PathBuf>,
}

impl Inventory {
    /// An in-memory inventory.
    pub fn from_rows(rows: Vec<DeviceRow>) -> Self {
        Self { rows: RwLock::new(rows), path: None }
    }

    /// Load from a CSV file; later serial changes are written back to it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Inventory file not found or unreadable: {}", path.display()))?;
        let rows = parse_inventory(&text)
            .with_context(|| format!("Invalid inventory file: {}", path.display()))?;
        tracing::info!(path = %path.display(), rows = rows.len(), "Inventory loaded");
        Ok(Self { rows: RwLock::new(rows), path: Some(path.to_path_buf()) })
    }

    /// All rows in file order.
    pub fn rows(&self) -> Vec<DeviceRow> {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Distinct non-empty serials in file order.
    pub fn serials(&self) -> Vec<String> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = std::collections::HashSet::new();
        let serials = rows
            .iter()
            .filter(|r| !r.serial.is_empty() && seen.insert(r.serial.as_str()))
            .map(|r| r.serial.clone())
            .collect();
        serials
    }

    /// First row whose site matches (surrounding whitespace ignored).
    pub fn find_by_site(&self, site: &str) -> Option<DeviceRow> {
        let site = site.trim();
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.site.trim() == site)
            .cloned()
    }

    /// Point every row at `site` to a new serial and persist.
    /// Returns `None` when no row has that site.
    pub fn update_serial(&self, site: &str, new_serial: &str) -> Result<Option<SerialChange>> {
        let site = site.trim();
        let new_serial = normalize_serial(new_serial);

        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        if !rows.iter().any(|r| r.site.trim() == site) {
            return Ok(None);
        }

        let mut updated = rows.clone();
        let mut old = Vec::new();
        for row in updated.iter_mut().filter(|r| r.site.trim() == site) {
            if !row.serial.is_empty() && !old.contains(&row.serial) {
                old.push(row.serial.clone());
            }
            row.serial = new_serial.clone();
        }

        // Persist first so memory never runs ahead of the file.
        if let Some(path) = &self.path {
            atomic_write(path, &render_inventory(&updated))
                .with_context(|| format!("Failed to persist inventory to {}", path.display()))?;
        }
        *rows = updated;

        tracing::info!(site = %site, old = ?old, new = %new_serial, "Device serial updated");
        Ok(Some(SerialChange { site: site.to_string(), old, new: new_serial }))
    }
}

/// Normalize a serial cell the way spreadsheets mangle them: trim, treat
/// `nan` as empty, drop a trailing `.0` from numeric cells.
pub fn normalize_serial(raw: &str) -> String {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("nan") {
        return String::new();
    }
    s.strip_suffix(".0").unwrap_or(s).to_string()
}

/// Parse inventory CSV text. Header names are matched case-insensitively.
pub fn parse_inventory(text: &str) -> Result<Vec<DeviceRow>> {
    let mut records = csv::parse_records(text)?.into_iter();
    let header = match records.next() {
        Some(h) => h,
        None => bail!("Inventory is empty (missing header row)"),
    };
    let header: Vec<String> = header.iter().map(|h| h.trim().to_uppercase()).collect();
    let col = |name: &str| header.iter().position(|h| h == name);

    let (serial_idx, site_idx, name_idx) = match (col(COL_SERIAL), col(COL_SITE), col(COL_NAME)) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => {
            let mut missing: Vec<&str> = [COL_SERIAL, COL_SITE, COL_NAME]
                .into_iter()
                .filter(|&c| col(c).is_none())
                .collect();
            missing.sort_unstable();
            bail!("Missing required columns in inventory: {}", missing.join(", "));
        }
    };

    let cell = |rec: &[String], i: usize| rec.get(i).map(|s| s.trim().to_string()).unwrap_or_default();
    Ok(records
        .map(|rec| DeviceRow {
            serial: normalize_serial(&cell(rec.as_slice(), serial_idx)),
            site: cell(rec.as_slice(), site_idx),
            display_name: cell(rec.as_slice(), name_idx),
        })
        .collect())
}

/// Render rows back into inventory CSV.
pub fn render_inventory(rows: &[DeviceRow]) -> String {
    let mut out = format!("{},{},{}\n", COL_SERIAL, COL_SITE, COL_NAME);
    for r in rows {
        out.push_str(&format!(
            "{},{},{}\n",
            csv::quote(&r.serial),
            csv::quote(&r.site),
            csv::quote(&r.display_name)
        ));
    }
    out
}

/// Write via temp file + fsync + rename so a crash never leaves a torn file.
fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("csv.tmp");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .context("Failed to create temp inventory file")?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path).context("Atomic rename failed")?;
    Ok(())
}
