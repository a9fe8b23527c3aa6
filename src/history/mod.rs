// src/history/mod.rs
//
// Completed cycles persisted per (thing, program): the data the prediction
// engine learns from. Each history is a bounded ring of the most recent
// cycles, stored as JSON.

mod builder;
mod index;
mod store;
mod validator;

pub use builder::HistoryUpdater;
pub use index::IndexEntry;
pub use store::{HistoryError, HistoryStore, MAX_HISTORY_LENGTH};
pub use validator::{validate_phases, PhaseError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The maximum cycle duration considered for predictions, in seconds.
/// Longer cycles are junk data from a stuck upstream.
pub const MAX_CYCLE_SECS: i64 = 300;

/// The minimum cycle duration considered for predictions, in seconds.
pub const MIN_CYCLE_SECS: i64 = 10;

/// A phase change of a traffic light, reduced from the raw observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPhaseEvent {
    pub time: DateTime<Utc>,
    pub color: u8,
}

/// A vehicle detection, either a car or a bike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDetectionEvent {
    pub time: DateTime<Utc>,
    /// The signal group whose detector fired.
    pub signal: String,
    /// Detector occupancy, 0 to 100 percent.
    pub pct: u8,
}

/// One completed cycle in the history of a traffic light.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryCycle {
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    /// The program that was running during the cycle, if known.
    pub program: Option<u8>,
    /// Signal phases during or right before the cycle, sorted by time.
    pub phases: Vec<HistoryPhaseEvent>,
    /// Car detections during or right before the cycle, sorted by time.
    pub cars: Vec<HistoryDetectionEvent>,
    /// Bike detections during or right before the cycle, sorted by time.
    pub bikes: Vec<HistoryDetectionEvent>,
}

impl HistoryCycle {
    /// The cycle duration in whole seconds. Negative for inverted windows.
    fn duration_secs(&self) -> i64 {
        self.end_time.timestamp() - self.start_time.timestamp()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub cycles: Vec<HistoryCycle>,
}

impl History {
    /// Flatten each usable cycle into a row of one color byte per second.
    ///
    /// Cycles with an inverted window, shorter than [`MIN_CYCLE_SECS`],
    /// longer than [`MAX_CYCLE_SECS`] or without any phases are skipped.
    pub fn flatten(&self) -> Vec<Vec<u8>> {
        let mut rows = Vec::new();
        for cycle in &self.cycles {
            if cycle.phases.is_empty() {
                continue;
            }
            let duration = cycle.duration_secs();
            if duration < MIN_CYCLE_SECS || duration > MAX_CYCLE_SECS {
                continue;
            }
            let start = cycle.start_time.timestamp();
            let mut row = vec![0u8; duration as usize];
            for (i, phase) in cycle.phases.iter().enumerate() {
                let from = (phase.time.timestamp() - start).max(0);
                let to = if i == cycle.phases.len() - 1 {
                    // Fill the rest of the cycle with the last phase.
                    duration.max(from)
                } else {
                    // Fill until the next phase.
                    (cycle.phases[i + 1].time.timestamp() - start)
                        .min(duration)
                        .max(from)
                };
                for second in from..to {
                    row[second as usize] = phase.color;
                }
            }
            rows.push(row);
        }
        rows
    }
}
