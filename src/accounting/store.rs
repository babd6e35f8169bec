use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::domain::{Provider, Result, TokenOpsError, UsageRecord};

pub const STATE_VERSION: u32 = 1;

/// On-disk accountant state. Written whole; replaced atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub providers: Vec<Provider>,
    pub usage_records: Vec<UsageRecord>,
    pub last_saved: DateTime<Utc>,
}

/// Full-file JSON persistence with temp-file-then-rename replacement.
pub struct UsageStore {
    path: PathBuf,
}

impl UsageStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load persisted state, pruning records older than `retention_days`.
    /// A missing file is not an error.
    pub fn load(&self, retention_days: i64) -> Result<Option<PersistedState>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut state: PersistedState = serde_json::from_str(&contents)?;
        if state.version > STATE_VERSION {
            return Err(TokenOpsError::Persistence(format!(
                "unsupported state version {}",
                state.version
            )));
        }

        let cutoff = Utc::now() - Duration::days(retention_days);
        let before = state.usage_records.len();
        state.usage_records.retain(|r| r.timestamp >= cutoff);
        if state.usage_records.len() != before {
            debug!(
                pruned = before - state.usage_records.len(),
                "dropped records outside retention on load"
            );
        }

        Ok(Some(state))
    }

    /// Serialize and atomically replace the state file. The parent directory
    /// is created as needed.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            warn!(error = %e, path = %self.path.display(), "state file replace failed");
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Currency;
    use rust_decimal_macros::dec;

    fn record_at(timestamp: DateTime<Utc>) -> UsageRecord {
        UsageRecord::new(
            "claude-code",
            "claude-3-5-sonnet-20241022",
            "inspector",
            "detection",
            100,
            50,
            dec!(0.001),
            Currency::USD,
        )
        .with_timestamp(timestamp)
    }

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = UsageStore::new(dir.path().join("usage.json"));
        assert!(store.load(30).unwrap().is_none());
    }

    #[test]
    fn test_round_trip_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = UsageStore::new(dir.path().join("nested/state/usage.json"));

        let state = PersistedState {
            version: STATE_VERSION,
            providers: vec![],
            usage_records: vec![record_at(Utc::now())],
            last_saved: Utc::now(),
        };
        store.save(&state).unwrap();

        let loaded = store.load(30).unwrap().unwrap();
        assert_eq!(loaded.usage_records.len(), 1);
        assert_eq!(loaded.usage_records[0].total_tokens, 150);
        assert_eq!(loaded.usage_records[0].cost, dec!(0.001));
    }

    #[test]
    fn test_load_prunes_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = UsageStore::new(dir.path().join("usage.json"));

        let state = PersistedState {
            version: STATE_VERSION,
            providers: vec![],
            usage_records: vec![
                record_at(Utc::now()),
                record_at(Utc::now() - Duration::days(45)),
            ],
            last_saved: Utc::now(),
        };
        store.save(&state).unwrap();

        let loaded = store.load(30).unwrap().unwrap();
        assert_eq!(loaded.usage_records.len(), 1);
    }

    #[test]
    fn test_future_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "providers": [], "usageRecords": [], "lastSaved": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let store = UsageStore::new(path);
        assert!(store.load(30).is_err());
    }
}
