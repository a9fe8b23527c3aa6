// src/registry.rs
//
// Process-wide cycle state, one map per sensor stream, keyed by thing name.

use std::sync::Arc;

use dashmap::DashMap;

use crate::cycle::Cycle;
use crate::observation::{Observation, StreamKind};

/// All running cycles in the process. Lookups are lock-free; a miss inserts
/// a fresh empty cycle atomically.
#[derive(Debug, Default)]
pub struct CycleRegistry {
    primary_signal: DashMap<String, Arc<Cycle>>,
    signal_program: DashMap<String, Arc<Cycle>>,
    cycle_second: DashMap<String, Arc<Cycle>>,
    detector_car: DashMap<String, Arc<Cycle>>,
    detector_bike: DashMap<String, Arc<Cycle>>,
}

impl CycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: StreamKind) -> &DashMap<String, Arc<Cycle>> {
        match kind {
            StreamKind::PrimarySignal => &self.primary_signal,
            StreamKind::SignalProgram => &self.signal_program,
            StreamKind::CycleSecond => &self.cycle_second,
            StreamKind::DetectorCar => &self.detector_car,
            StreamKind::DetectorBike => &self.detector_bike,
        }
    }

    /// The cycle for `(kind, thing)`, created on first access.
    pub fn get_or_create(&self, kind: StreamKind, thing: &str) -> Arc<Cycle> {
        self.map(kind)
            .entry(thing.to_string())
            .or_insert_with(|| Arc::new(Cycle::new()))
            .clone()
    }

    pub fn get(&self, kind: StreamKind, thing: &str) -> Option<Arc<Cycle>> {
        self.map(kind).get(thing).map(|cycle| cycle.clone())
    }

    /// Visit every cycle of one stream kind.
    pub fn for_each(&self, kind: StreamKind, mut visit: impl FnMut(&str, &Arc<Cycle>)) {
        for entry in self.map(kind).iter() {
            visit(entry.key(), entry.value());
        }
    }

    /// The color the signal most recently reported, if any observation was
    /// ever received for it.
    pub fn current_primary_signal(&self, thing: &str) -> Option<Observation> {
        self.get(StreamKind::PrimarySignal, thing)?.most_recent()
    }

    /// The program the signal controller most recently reported.
    pub fn current_program(&self, thing: &str) -> Option<Observation> {
        self.get(StreamKind::SignalProgram, thing)?.most_recent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn obs(secs: i64, result: u8) -> Observation {
        let time = Utc.timestamp_opt(secs, 0).unwrap();
        Observation {
            phenomenon_time: time,
            received_time: time,
            result,
        }
    }

    #[test]
    fn test_get_or_create_returns_the_same_cycle() {
        let registry = CycleRegistry::new();
        let first = registry.get_or_create(StreamKind::PrimarySignal, "271_31");
        first.add(obs(1, 3));
        let second = registry.get_or_create(StreamKind::PrimarySignal, "271_31");
        assert!(Arc::ptr_eq(&first, &second));
        // Streams are independent.
        assert!(registry.get(StreamKind::DetectorCar, "271_31").is_none());
    }

    #[test]
    fn test_current_program_reads_the_most_recent_observation() {
        let registry = CycleRegistry::new();
        assert!(registry.current_program("271_31").is_none());
        let cycle = registry.get_or_create(StreamKind::SignalProgram, "271_31");
        cycle.add(obs(1, 7));
        cycle.add(obs(2, 9));
        assert_eq!(registry.current_program("271_31").unwrap().result, 9);
    }
}
