//! Cross-run proxy history.
//!
//! A JSON map from the hash of a config's normalized text to its last
//! test outcome. Only used to break ties when ranking configs whose
//! current ping is unknown; losing it is never fatal.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::HashComputer;
use crate::error::PersistError;
use crate::output::write_atomic;
use crate::tester::TestedConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyHistoryEntry {
    /// Last measured latency; kept from the previous success when a later test fails.
    pub ping_ms: Option<f64>,
    pub success: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyHistory {
    entries: BTreeMap<String, ProxyHistoryEntry>,
}

impl ProxyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing, unreadable or corrupt file yields an
    /// empty history and a warning.
    pub async fn load(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("no proxy history at {}, starting empty", path.display());
            return Self::new();
        }
        let data = match tokio::fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("failed to read proxy history at {}: {e}", path.display());
                return Self::new();
            }
        };
        match serde_json::from_str::<BTreeMap<String, ProxyHistoryEntry>>(&data) {
            Ok(entries) => Self { entries },
            Err(e) => {
                tracing::warn!("corrupt proxy history at {}, ignoring: {e}", path.display());
                Self::new()
            }
        }
    }

    /// Atomically replace the file at `path`.
    pub async fn save(&self, path: &Path) -> Result<(), PersistError> {
        let json = serde_json::to_string_pretty(&self.entries).map_err(|e| PersistError::Encode {
            format: "history".into(),
            reason: e.to_string(),
        })?;
        write_atomic(path, json.as_bytes()).await
    }

    /// Record the outcome of every tested config. Untested configs are skipped.
    pub fn update<'a>(&mut self, results: impl IntoIterator<Item = &'a TestedConfig>, hasher: &dyn HashComputer) {
        for result in results {
            let Some(tested_at) = result.tested_at else {
                continue;
            };
            let key = hasher.history_key(&result.config.raw_text);
            let previous_ping = self.entries.get(&key).and_then(|e| e.ping_ms);
            self.entries.insert(
                key,
                ProxyHistoryEntry {
                    ping_ms: result.ping_ms.or(previous_ping),
                    success: result.reachable,
                    last_seen: tested_at,
                },
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<&ProxyHistoryEntry> {
        self.entries.get(key)
    }

    /// Ping of the last successful test of `key`.
    pub fn historic_ping(&self, key: &str) -> Option<f64> {
        self.entries
            .get(key)
            .filter(|e| e.success)
            .and_then(|e| e.ping_ms)
    }

    /// Every successful ping, for ranking.
    pub fn successful_pings(&self) -> HashMap<String, f64> {
        self.entries
            .iter()
            .filter(|(_, e)| e.success)
            .filter_map(|(k, e)| e.ping_ms.map(|p| (k.clone(), p)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
