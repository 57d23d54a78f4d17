use anyhow::anyhow;
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

use crate::db;
use crate::resolver::Timestamp;

pub const ENV_LOG: &str = "HORTD_LOG";
pub const ENV_WORKSPACE: &str = "HORTD_WORKSPACE";
pub const DEFAULT_LOG_LEVEL: &str = "warn";

pub const KEY_UTC_OFFSET_MINUTES: &str = "facility.utc_offset_minutes";
const MAX_OFFSET_MINUTES: i64 = 14 * 60;

/// Process-level settings, read once from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub log_filter: Option<String>,
    pub workspace: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var(ENV_LOG).ok().filter(|v| !v.trim().is_empty()),
            workspace: std::env::var_os(ENV_WORKSPACE).map(PathBuf::from),
        }
    }
}

/// Per-workspace settings, stored in the `settings` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FacilityConfig {
    pub utc_offset_minutes: i32,
}

impl FacilityConfig {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = db::settings_get_json(conn, KEY_UTC_OFFSET_MINUTES)? {
            cfg.utc_offset_minutes = parse_offset(&v)?;
        }
        Ok(cfg)
    }

    pub fn to_json(self) -> serde_json::Value {
        json!({ "facility.utc_offset_minutes": self.utc_offset_minutes })
    }

    /// Facility-local calendar day of `ts`. Attendance is grouped by it.
    pub fn local_day(&self, ts: &Timestamp) -> NaiveDate {
        let offset =
            FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        ts.with_timezone(&offset).date_naive()
    }
}

pub fn parse_offset(v: &serde_json::Value) -> anyhow::Result<i32> {
    let n = v
        .as_i64()
        .ok_or_else(|| anyhow!("{KEY_UTC_OFFSET_MINUTES} must be an integer"))?;
    if !(-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&n) {
        return Err(anyhow!(
            "{KEY_UTC_OFFSET_MINUTES} must be between -{max} and {max}",
            max = MAX_OFFSET_MINUTES
        ));
    }
    Ok(n as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn local_day_follows_offset() {
        let late = Utc.with_ymd_and_hms(2026, 10, 16, 23, 30, 0).unwrap();
        let utc = FacilityConfig::default();
        assert_eq!(utc.local_day(&late), NaiveDate::from_ymd_opt(2026, 10, 16).unwrap());
        let berlin = FacilityConfig {
            utc_offset_minutes: 120,
        };
        assert_eq!(berlin.local_day(&late), NaiveDate::from_ymd_opt(2026, 10, 17).unwrap());
    }

    #[test]
    fn offset_is_range_checked() {
        assert_eq!(parse_offset(&json!(60)).unwrap(), 60);
        assert!(parse_offset(&json!(900)).is_err());
        assert!(parse_offset(&json!("60")).is_err());
    }
}
