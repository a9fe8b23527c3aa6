// src/history/index.rs
//
// A single index file over all cached histories, consumed by the cycle
// analyzer dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HistoryError, HistoryStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The history file name, without directories.
    pub file: String,
    /// The end time of the most recent cycle.
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    /// Whether any cycle in the history detected a car.
    #[serde(rename = "carDetected")]
    pub car_detected: bool,
    /// Whether any cycle in the history detected a bike.
    #[serde(rename = "bikeDetected")]
    pub bike_detected: bool,
    #[serde(rename = "cycleCount")]
    pub cycle_count: usize,
}

impl HistoryStore {
    /// Write `<static>/index.json` with one entry per non-empty cached
    /// history.
    pub async fn write_index(&self) -> Result<(), HistoryError> {
        let mut entries: Vec<IndexEntry> = Vec::new();
        self.for_each_cached(|path, history| {
            let Some(last) = history.cycles.last() else {
                return;
            };
            let file = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push(IndexEntry {
                file,
                last_updated: last.end_time,
                car_detected: history.cycles.iter().any(|c| !c.cars.is_empty()),
                bike_detected: history.cycles.iter().any(|c| !c.bikes.is_empty()),
                cycle_count: history.cycles.len(),
            });
        });

        let json = serde_json::to_vec(&entries)?;
        let _guard = self.index_lock.lock().await;
        let path = self.static_path().join("index.json");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::tests::{cycle, temp_static_path};
    use super::*;
    use crate::registry::CycleRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_index_lists_non_empty_histories() {
        let static_path = temp_static_path("index");
        let store = HistoryStore::new(&static_path, Arc::new(CycleRegistry::new()));

        let path = store.history_path("271_31", Some(7));
        store.append(&path, cycle(0, 90)).await.unwrap();
        store.append(&path, cycle(100, 190)).await.unwrap();
        store.write_index().await.unwrap();

        let bytes = std::fs::read(static_path.join("index.json")).unwrap();
        let entries: Vec<IndexEntry> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file, "271_31-P7.json");
        assert_eq!(entries[0].cycle_count, 2);
        assert!(!entries[0].car_detected);
        assert!(!entries[0].bike_detected);
    }

    #[tokio::test]
    async fn test_write_index_without_histories_is_empty() {
        let static_path = temp_static_path("index-empty");
        let store = HistoryStore::new(&static_path, Arc::new(CycleRegistry::new()));
        store.write_index().await.unwrap();
        let bytes = std::fs::read(static_path.join("index.json")).unwrap();
        let entries: Vec<IndexEntry> = serde_json::from_slice(&bytes).unwrap();
        assert!(entries.is_empty());
    }
}
