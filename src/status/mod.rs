//! Device status model and the in-memory status cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod cache;

pub use cache::{CacheError, StatusCache};

/// Externally visible device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    /// Never scanned, or invalidated since the last scan.
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cache row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub serial: String,
    pub status: DeviceStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Query filter. Unknown devices are "not confirmed online" and therefore
/// fall under `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    All,
    Online,
    Offline,
}

impl StatusFilter {
    pub fn matches(&self, status: DeviceStatus) -> bool {
        match self {
            Self::All => true,
            Self::Online => status == DeviceStatus::Online,
            Self::Offline => status != DeviceStatus::Online,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(format!("invalid status filter: {:?}", other)),
        }
    }
}

/// Aggregate counts. `online + offline == total` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Stats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
}

impl Stats {
    pub fn tally<I: IntoIterator<Item = DeviceStatus>>(statuses: I) -> Self {
        let mut s = Self::default();
        for status in statuses {
            s.total += 1;
            if status == DeviceStatus::Online {
                s.online += 1;
            } else {
                s.offline += 1;
            }
        }
        s
    }
}
