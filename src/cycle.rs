// src/cycle.rs
//
// The per-stream cycle state machine. A cycle accumulates observations into
// three buckets and is rotated whenever a cycle tick arrives: pending
// observations inside the new window become the completed cycle, and the
// last observation before the window is kept as outdated so that there is
// always at least one known value.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

use crate::observation::Observation;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleError {
    /// Both boundaries must be known before a rotation can take place. The
    /// very first tick only primes the end time for the next one.
    #[error("cycle not yet complete")]
    NotYetComplete,
    #[error("cycle end time is before its start time")]
    EndBeforeStart,
}

#[derive(Debug, Default)]
struct CycleState {
    /// Observations after the end of the last completed cycle, sorted by
    /// `phenomenon_time` ascending.
    pending: Vec<Observation>,
    /// Observations inside the last completed cycle, sorted by
    /// `phenomenon_time` ascending.
    completed: Vec<Observation>,
    /// The last observation before the start of the last completed cycle.
    outdated: Option<Observation>,
    /// Start of the last completed cycle.
    start_time: Option<DateTime<Utc>>,
    /// End of the last completed cycle.
    end_time: Option<DateTime<Utc>>,
}

/// An immutable copy of a cycle, taken at rotation time or on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSnapshot {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub pending: Vec<Observation>,
    pub completed: Vec<Observation>,
    pub outdated: Option<Observation>,
}

impl CycleSnapshot {
    /// The newest observation in the snapshot, searching pending, then
    /// completed, then outdated.
    pub fn most_recent(&self) -> Option<Observation> {
        self.pending
            .last()
            .or(self.completed.last())
            .copied()
            .or(self.outdated)
    }
}

/// The running cycle for one (thing, stream) pair. All methods are safe for
/// concurrent use; the buckets are protected by a single lock so that a
/// rotation never observes a half-applied insert.
#[derive(Debug, Default)]
pub struct Cycle {
    state: RwLock<CycleState>,
}

fn insert_sorted(list: &mut Vec<Observation>, observation: Observation) {
    // Inserting at the tail is the expected fast path; late arrivals from the
    // broker land wherever their phenomenon time puts them.
    let at = list.partition_point(|o| o.phenomenon_time <= observation.phenomenon_time);
    list.insert(at, observation);
}

impl Cycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new observation, classified by its phenomenon time against the
    /// current window. Tolerates duplicates and out-of-order arrival.
    pub fn add(&self, observation: Observation) {
        let mut state = self.state.write();
        if state
            .start_time
            .is_some_and(|start| observation.phenomenon_time < start)
        {
            state.outdated = Some(observation);
            return;
        }
        if state
            .end_time
            .is_some_and(|end| observation.phenomenon_time < end)
        {
            insert_sorted(&mut state.completed, observation);
            return;
        }
        insert_sorted(&mut state.pending, observation);
    }

    /// Keep only the newest `cap` pending observations.
    pub fn truncate_pending(&self, cap: usize) {
        let mut state = self.state.write();
        if state.pending.len() > cap {
            let excess = state.pending.len() - cap;
            state.pending.drain(..excess);
        }
    }

    /// The newest observation in the cycle, searching pending, then
    /// completed, then outdated.
    pub fn most_recent(&self) -> Option<Observation> {
        let state = self.state.read();
        state
            .pending
            .last()
            .or(state.completed.last())
            .copied()
            .or(state.outdated)
    }

    /// End of the last completed cycle, if a rotation has happened yet.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().end_time
    }

    /// An immutable copy of the current state.
    pub fn snapshot(&self) -> CycleSnapshot {
        let state = self.state.read();
        CycleSnapshot {
            start_time: state.start_time,
            end_time: state.end_time,
            pending: state.pending.clone(),
            completed: state.completed.clone(),
            outdated: state.outdated,
        }
    }

    /// Rotate the cycle to a new window. All buckets are merged and
    /// repartitioned against `[new_start, new_end)`: the latest observation
    /// before the window becomes outdated, observations inside it become the
    /// completed cycle, and everything after stays pending.
    ///
    /// The boundaries are stored before they are checked for absence, so a
    /// failed first rotation still primes the end time for the next tick.
    pub fn complete(
        &self,
        new_start: Option<DateTime<Utc>>,
        new_end: Option<DateTime<Utc>>,
    ) -> Result<CycleSnapshot, CycleError> {
        let mut state = self.state.write();

        if let (Some(start), Some(end)) = (new_start, new_end) {
            if end < start {
                return Err(CycleError::EndBeforeStart);
            }
        }

        state.start_time = new_start;
        state.end_time = new_end;

        let (Some(start), Some(end)) = (new_start, new_end) else {
            return Err(CycleError::NotYetComplete);
        };

        // Collect everything the cycle holds, in ascending order. The
        // individual buckets are already sorted, outdated precedes them all.
        let mut all: Vec<Observation> = Vec::with_capacity(
            state.completed.len() + state.pending.len() + usize::from(state.outdated.is_some()),
        );
        all.extend(state.outdated.take());
        all.append(&mut state.completed);
        all.append(&mut state.pending);
        all.sort_by_key(|o| o.phenomenon_time);

        for observation in all {
            if observation.phenomenon_time < start {
                state.outdated = Some(observation);
            } else if observation.phenomenon_time < end {
                state.completed.push(observation);
            } else {
                state.pending.push(observation);
            }
        }

        Ok(CycleSnapshot {
            start_time: state.start_time,
            end_time: state.end_time,
            pending: state.pending.clone(),
            completed: state.completed.clone(),
            outdated: state.outdated,
        })
    }
}
