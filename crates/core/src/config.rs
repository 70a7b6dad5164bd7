//! Runtime configuration for a sync session.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::sync::{DIRTY_THRESHOLD, RECONCILE_INTERVAL_SECS};

/// Maximum number of writes per remote batch commit.
pub const DEFAULT_BATCH_WRITE_LIMIT: usize = 500;

/// Poll cadence for listener emulation on backends without push.
pub const DEFAULT_LISTEN_POLL_INTERVAL_SECS: u64 = 5;

const DEFAULT_DATABASE_FILE: &str = "tripsync.sqlite";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub sync_interval_secs: u64,
    pub dirty_threshold: usize,
    pub batch_write_limit: usize,
    pub listen_poll_interval_secs: u64,
    pub database_path: String,
    pub document_api_url: Option<String>,
    pub project_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: RECONCILE_INTERVAL_SECS,
            dirty_threshold: DIRTY_THRESHOLD,
            batch_write_limit: DEFAULT_BATCH_WRITE_LIMIT,
            listen_poll_interval_secs: DEFAULT_LISTEN_POLL_INTERVAL_SECS,
            database_path: DEFAULT_DATABASE_FILE.to_string(),
            document_api_url: None,
            project_id: None,
        }
    }
}

impl SyncConfig {
    /// Builds the configuration from `TRIPSYNC_*` environment variables,
    /// falling back to defaults for anything unset or blank.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Ok(Self {
            sync_interval_secs: parse_or(
                get("TRIPSYNC_SYNC_INTERVAL_SECS"),
                "TRIPSYNC_SYNC_INTERVAL_SECS",
                defaults.sync_interval_secs,
            )?,
            dirty_threshold: parse_or(
                get("TRIPSYNC_DIRTY_THRESHOLD"),
                "TRIPSYNC_DIRTY_THRESHOLD",
                defaults.dirty_threshold,
            )?,
            batch_write_limit: parse_or(
                get("TRIPSYNC_BATCH_WRITE_LIMIT"),
                "TRIPSYNC_BATCH_WRITE_LIMIT",
                defaults.batch_write_limit,
            )?,
            listen_poll_interval_secs: parse_or(
                get("TRIPSYNC_LISTEN_POLL_INTERVAL_SECS"),
                "TRIPSYNC_LISTEN_POLL_INTERVAL_SECS",
                defaults.listen_poll_interval_secs,
            )?,
            database_path: get("TRIPSYNC_DATABASE_PATH").unwrap_or(defaults.database_path),
            document_api_url: get("TRIPSYNC_DOCUMENT_API_URL")
                .map(|v| v.trim_end_matches('/').to_string()),
            project_id: get("TRIPSYNC_PROJECT_ID"),
        }
        .validated()?)
    }

    fn validated(self) -> Result<Self> {
        if self.sync_interval_secs == 0 {
            return Err(Error::invalid_input("sync interval must be at least one second"));
        }
        if self.batch_write_limit == 0 {
            return Err(Error::invalid_input("batch write limit must be positive"));
        }
        Ok(self)
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| Error::invalid_input(format!("{} has invalid value '{}'", key, value))),
        None => Ok(default),
    }
}
