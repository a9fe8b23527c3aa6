// src/observation.rs
//
// The observation model shared by all five sensor streams, plus the
// validator that rejects stale records before they enter a cycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

/// Observations older than this are discarded for all time-sensitive streams.
pub const MAX_OBSERVATION_AGE_SECS: i64 = 300;

/// The five sensor streams published per signal group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Which color the signal is currently showing.
    PrimarySignal,
    /// Which program the signal controller is currently running.
    SignalProgram,
    /// The tick that marks the boundary between two cycles.
    CycleSecond,
    /// Car detector occupancy, 0 to 100 percent.
    DetectorCar,
    /// Bike detector occupancy, 0 to 100 percent.
    DetectorBike,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::PrimarySignal,
        StreamKind::SignalProgram,
        StreamKind::CycleSecond,
        StreamKind::DetectorCar,
        StreamKind::DetectorBike,
    ];

    /// The `layerName` used by the upstream catalog for this stream.
    pub fn layer_name(&self) -> &'static str {
        match self {
            StreamKind::PrimarySignal => "primary_signal",
            StreamKind::SignalProgram => "signal_program",
            StreamKind::CycleSecond => "cycle_second",
            StreamKind::DetectorCar => "detector_car",
            StreamKind::DetectorBike => "detector_bike",
        }
    }

    pub fn from_layer_name(name: &str) -> Option<StreamKind> {
        StreamKind::ALL
            .into_iter()
            .find(|kind| kind.layer_name() == name)
    }

    /// Program changes are rare and an old value remains meaningful, so the
    /// `signal_program` stream is exempt from the staleness check.
    fn validates_age(&self) -> bool {
        !matches!(self, StreamKind::SignalProgram)
    }
}

/// A single decoded sensor observation.
///
/// The result is stored as a byte. All streams we consume report values
/// below 256, and a byte per second keeps the flattened cycle rows compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The time when the observation was made at the site.
    pub phenomenon_time: DateTime<Utc>,
    /// The time when this process decoded the message. Not part of the wire
    /// format; used to measure the upstream delay.
    pub received_time: DateTime<Utc>,
    /// The observed value, clamped to `0..=255`.
    pub result: u8,
}

impl<'de> Deserialize<'de> for Observation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "phenomenonTime")]
            phenomenon_time: DateTime<Utc>,
            // Cycle tick observations may omit the result entirely.
            #[serde(default)]
            result: i64,
        }

        let received_time = Utc::now();
        let raw = Raw::deserialize(deserializer)?;
        if raw.result > 255 {
            warn!("Observation result is too large: {}", raw.result);
        }
        Ok(Observation {
            phenomenon_time: raw.phenomenon_time,
            received_time,
            result: raw.result.clamp(0, 255) as u8,
        })
    }
}

#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("{layer} observation is too old: {age_secs} seconds")]
    TooOld { layer: &'static str, age_secs: i64 },
}

/// Check that an observation is recent enough to be used for the given
/// stream kind.
pub fn validate(observation: &Observation, kind: StreamKind) -> Result<(), ObservationError> {
    if !kind.validates_age() {
        return Ok(());
    }
    let age = Utc::now() - observation.phenomenon_time;
    if age > Duration::seconds(MAX_OBSERVATION_AGE_SECS) {
        return Err(ObservationError::TooOld {
            layer: kind.layer_name(),
            age_secs: age.num_seconds(),
        });
    }
    Ok(())
}
