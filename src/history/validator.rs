// src/history/validator.rs
//
// Sanity checks on the phase events of a completed cycle before it enters
// the history. A cycle with impossible color transitions or implausibly
// long transition phases would poison every later prediction.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::phases;

use super::HistoryPhaseEvent;

/// Transition phases (red-amber after red, amber after green) never last
/// longer than this many seconds on a sane controller.
const MAX_TRANSITION_SECS: i64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("no phases")]
    Empty,
    #[error("no phase before start time")]
    NoPhaseBeforeStart,
    #[error("{} -> {} is disallowed", phases::name(*from), phases::name(*to))]
    IllegalTransition { from: u8, to: u8 },
    #[error("{} phase is too long: {secs} seconds", phases::name(*color))]
    TransitionTooLong { color: u8, secs: i64 },
}

/// Typical cycles:
/// - red -> red-amber -> green -> amber -> red
/// - red -> green -> red
const ILLEGAL_TRANSITIONS: [(u8, u8); 6] = [
    (phases::RED, phases::AMBER),
    (phases::AMBER, phases::GREEN),
    (phases::AMBER, phases::RED_AMBER),
    (phases::GREEN, phases::RED_AMBER),
    (phases::RED_AMBER, phases::RED),
    (phases::RED_AMBER, phases::AMBER),
];

/// Check that the phase events form a plausible cycle over
/// `[start_time, end_time)`.
pub fn validate_phases(
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    events: &[HistoryPhaseEvent],
) -> Result<(), PhaseError> {
    if events.is_empty() {
        return Err(PhaseError::Empty);
    }
    // We need at least one phase before the start time for a full cycle.
    if events[0].time > start_time {
        return Err(PhaseError::NoPhaseBeforeStart);
    }
    for i in 1..events.len() {
        let prev = events[i - 1];
        let curr = events[i];
        if ILLEGAL_TRANSITIONS.contains(&(prev.color, curr.color)) {
            return Err(PhaseError::IllegalTransition {
                from: prev.color,
                to: curr.color,
            });
        }

        // The phase lasts until the next event, or until the cycle ends.
        let phase_secs = if i == events.len() - 1 {
            (end_time - curr.time).num_seconds().abs()
        } else {
            (events[i + 1].time - curr.time).num_seconds().abs()
        };
        let is_transition = (prev.color == phases::RED && curr.color == phases::RED_AMBER)
            || (prev.color == phases::GREEN && curr.color == phases::AMBER);
        if is_transition && phase_secs > MAX_TRANSITION_SECS {
            return Err(PhaseError::TransitionTooLong {
                color: curr.color,
                secs: phase_secs,
            });
        }
    }
    Ok(())
}
