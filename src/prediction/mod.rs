// src/prediction/mod.rs
//
// The prediction wire model: two concatenated color vectors ("now" for the
// running cycle, "then" for the cycles after it) with per-second confidence
// percentages. Byte vectors are base64 on the wire to keep the retained
// broker payloads small.

mod engine;
mod publisher;
mod quality;

pub use engine::{best_cluster, cluster, collapse, distance, flatten_window, predict};
pub use engine::{PredictionError, MAX_CLUSTER_DISTANCE};
pub use publisher::PredictionPublisher;
pub use quality::QualityTracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "thingName")]
    pub thing_name: String,
    /// Predicted colors for the running cycle, one byte per second.
    #[serde(with = "base64_bytes")]
    pub now: Vec<u8>,
    /// Confidence in percent for each second of `now`.
    #[serde(rename = "nowQuality", with = "base64_bytes")]
    pub now_quality: Vec<u8>,
    /// Predicted colors for the cycles after the running one.
    #[serde(with = "base64_bytes")]
    pub then: Vec<u8>,
    /// Confidence in percent for each second of `then`.
    #[serde(rename = "thenQuality", with = "base64_bytes")]
    pub then_quality: Vec<u8>,
    /// Where `now` starts on the time axis.
    #[serde(rename = "referenceTime")]
    pub reference_time: DateTime<Utc>,
    #[serde(rename = "programId")]
    pub program_id: Option<u8>,
}

impl Prediction {
    /// Whether this prediction would tell a subscriber the same thing as
    /// `other`. The quality vectors are left out of the comparison: a
    /// quality wiggle alone is not worth a republish.
    pub fn matches(&self, other: &Prediction) -> bool {
        self.thing_name == other.thing_name
            && self.now == other.now
            && self.then == other.then
            && self.reference_time == other.reference_time
            && self.program_id == other.program_id
    }

    /// The mean of both quality vectors, in percent.
    pub fn average_quality(&self) -> f64 {
        let count = self.now_quality.len() + self.then_quality.len();
        if count == 0 {
            return 0.0;
        }
        let sum: u64 = self
            .now_quality
            .iter()
            .chain(self.then_quality.iter())
            .map(|&quality| quality as u64)
            .sum();
        sum as f64 / count as f64
    }

    /// The color this prediction claims for `seconds` after the reference
    /// time. Runs through `now` once, then repeats `then` cyclically.
    pub fn color_at(&self, seconds: i64) -> Option<u8> {
        if seconds < 0 || self.now.is_empty() || self.then.is_empty() {
            return None;
        }
        let seconds = seconds as usize;
        if seconds < self.now.len() {
            return Some(self.now[seconds]);
        }
        let index = (seconds - self.now.len()) % self.then.len();
        Some(self.then[index])
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn prediction() -> Prediction {
        Prediction {
            thing_name: "271_31".to_string(),
            now: vec![3, 3, 3, 1, 1],
            now_quality: vec![100, 100, 100, 90, 90],
            then: vec![1, 1, 3, 3],
            then_quality: vec![80, 80, 80, 80],
            reference_time: Utc.timestamp_opt(1_669_262_000, 0).unwrap(),
            program_id: Some(7),
        }
    }

    #[test]
    fn test_matches_ignores_quality() {
        let a = prediction();
        let mut b = prediction();
        b.now_quality = vec![50, 50, 50, 50, 50];
        b.then_quality = vec![10, 10, 10, 10];
        assert!(a.matches(&b));
        assert!(b.matches(&a));
        assert!(a.matches(&a));
    }

    #[test]
    fn test_matches_compares_the_signal_content() {
        let a = prediction();

        let mut b = prediction();
        b.now[0] = 1;
        assert!(!a.matches(&b));

        let mut c = prediction();
        c.program_id = None;
        assert!(!a.matches(&c));

        let mut d = prediction();
        d.reference_time = d.reference_time + chrono::Duration::seconds(5);
        assert!(!a.matches(&d));
    }

    #[test]
    fn test_wire_format_is_base64() {
        let json = serde_json::to_value(prediction()).unwrap();
        assert_eq!(json["now"], "AwMDAQE=");
        assert!(json["referenceTime"].as_str().unwrap().contains("2022"));

        let decoded: Prediction = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, prediction());
    }

    #[test]
    fn test_color_at_runs_through_now_then_repeats_then() {
        let p = prediction();
        assert_eq!(p.color_at(0), Some(3));
        assert_eq!(p.color_at(4), Some(1));
        // Past `now`, `then` repeats cyclically.
        assert_eq!(p.color_at(5), Some(1));
        assert_eq!(p.color_at(7), Some(3));
        assert_eq!(p.color_at(9), Some(1));
        assert_eq!(p.color_at(-1), None);
    }
}
