// src/history/builder.rs
//
// Turns the rotation snapshots of one cycle tick into a HistoryCycle and
// appends it to the right history file.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::cycle::CycleSnapshot;

use super::{
    validate_phases, History, HistoryCycle, HistoryDetectionEvent, HistoryError, HistoryPhaseEvent,
    HistoryStore,
};

pub struct HistoryUpdater {
    store: Arc<HistoryStore>,
    requested: AtomicU64,
    processed: AtomicU64,
    cancelled: AtomicU64,
}

impl HistoryUpdater {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        HistoryUpdater {
            store,
            requested: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    /// (requested, processed, cancelled)
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.requested.load(Ordering::Relaxed),
            self.processed.load(Ordering::Relaxed),
            self.cancelled.load(Ordering::Relaxed),
        )
    }

    /// Assemble a HistoryCycle from the rotation snapshots and append it to
    /// the history file for the thing and its current program. Cycles whose
    /// phases fail validation are discarded entirely.
    pub async fn update(
        &self,
        thing: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        primary_signal: &CycleSnapshot,
        signal_program: &CycleSnapshot,
        detector_car: &CycleSnapshot,
        detector_bike: &CycleSnapshot,
    ) -> Result<History, HistoryError> {
        let requested = self.requested.fetch_add(1, Ordering::Relaxed) + 1;
        if requested % 1000 == 0 {
            let (_, processed, cancelled) = self.counters();
            info!(
                "History file updates requested {requested}, \
                 processed {processed}, cancelled {cancelled}"
            );
        }

        // Reconstruct the signal phases in the cycle. The outdated
        // observation provides the phase running at the window start.
        let mut phases: Vec<HistoryPhaseEvent> = Vec::new();
        let mut seen: HashMap<i64, u8> = HashMap::new();
        for observation in primary_signal
            .outdated
            .iter()
            .chain(primary_signal.completed.iter())
        {
            let event = HistoryPhaseEvent {
                time: observation.phenomenon_time,
                color: observation.result,
            };
            let second = event.time.timestamp();
            if seen.get(&second) == Some(&event.color) {
                continue;
            }
            phases.push(event);
            seen.insert(second, event.color);
        }
        phases.sort_by_key(|event| event.time);

        if let Err(err) = validate_phases(start_time, end_time, &phases) {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }

        let mut cycle = HistoryCycle {
            start_time,
            end_time,
            program: None,
            phases,
            cars: detections(detector_car, thing),
            bikes: detections(detector_bike, thing),
        };

        // File the cycle under the program the controller last reported.
        let program = signal_program
            .most_recent()
            .map(|observation| observation.result);
        cycle.program = program;
        let path = self.store.history_path(thing, program);

        match self.store.append(&path, cycle).await {
            Ok(history) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                Ok(history)
            }
            Err(err) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

/// Detection events from a detector snapshot, duplicates within the same
/// second dropped.
fn detections(snapshot: &CycleSnapshot, thing: &str) -> Vec<HistoryDetectionEvent> {
    let mut events: Vec<HistoryDetectionEvent> = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();
    for observation in snapshot.outdated.iter().chain(snapshot.completed.iter()) {
        if !seen.insert(observation.phenomenon_time.timestamp()) {
            continue;
        }
        events.push(HistoryDetectionEvent {
            time: observation.phenomenon_time,
            signal: thing.to_string(),
            pct: observation.result,
        });
    }
    events.sort_by_key(|event| event.time);
    events
}

#[cfg(test)]
mod tests {
    use super::super::store::tests::temp_static_path;
    use super::*;
    use crate::observation::Observation;
    use crate::phases;
    use crate::registry::CycleRegistry;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn obs(secs: i64, result: u8) -> Observation {
        Observation {
            phenomenon_time: at(secs),
            received_time: at(secs),
            result,
        }
    }

    fn updater(tag: &str) -> HistoryUpdater {
        let store = Arc::new(HistoryStore::new(
            temp_static_path(tag),
            Arc::new(CycleRegistry::new()),
        ));
        HistoryUpdater::new(store)
    }

    #[tokio::test]
    async fn test_update_assembles_a_cycle_from_snapshots() {
        let updater = updater("builder");
        let primary = CycleSnapshot {
            outdated: Some(obs(5, phases::RED)),
            completed: vec![
                obs(20, phases::GREEN),
                // A duplicate of the same phase within the same second.
                obs(20, phases::GREEN),
                obs(70, phases::RED),
            ],
            ..Default::default()
        };
        let program = CycleSnapshot {
            completed: vec![obs(15, 7)],
            ..Default::default()
        };
        let cars = CycleSnapshot {
            completed: vec![obs(30, 100), obs(30, 100), obs(40, 50)],
            ..Default::default()
        };
        let bikes = CycleSnapshot::default();

        let history = updater
            .update("271_31", at(10), at(100), &primary, &program, &cars, &bikes)
            .await
            .unwrap();

        let cycle = &history.cycles[0];
        assert_eq!(cycle.program, Some(7));
        let colors: Vec<u8> = cycle.phases.iter().map(|p| p.color).collect();
        assert_eq!(colors, vec![phases::RED, phases::GREEN, phases::RED]);
        assert_eq!(cycle.cars.len(), 2);
        assert_eq!(cycle.cars[0].signal, "271_31");
        assert!(cycle.bikes.is_empty());

        let (requested, processed, cancelled) = updater.counters();
        assert_eq!((requested, processed, cancelled), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_update_discards_cycles_with_invalid_phases() {
        let updater = updater("builder-invalid");
        // Red to amber is not a possible controller transition.
        let primary = CycleSnapshot {
            outdated: Some(obs(5, phases::RED)),
            completed: vec![obs(20, phases::AMBER)],
            ..Default::default()
        };
        let empty = CycleSnapshot::default();

        let result = updater
            .update("271_31", at(10), at(100), &primary, &empty, &empty, &empty)
            .await;
        assert!(matches!(result, Err(HistoryError::InvalidPhases(_))));

        let (requested, processed, cancelled) = updater.counters();
        assert_eq!((requested, processed, cancelled), (1, 0, 1));
        // Nothing was appended.
        assert!(matches!(
            updater.store.load_best("271_31").await,
            Err(HistoryError::NotFound { .. })
        ));
    }
}
