// src/prediction/quality.rs
//
// Continuous evaluation of the published predictions against the colors
// the signals actually report. The resulting per-thing accuracy feeds the
// status and metrics artifacts.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::catalog::Catalog;
use crate::registry::CycleRegistry;

use super::PredictionPublisher;

/// How many (predicted, actual) samples are kept per thing.
const SAMPLE_WINDOW: usize = 120;

/// Observations delayed longer than this make the comparison meaningless,
/// in seconds.
const MAX_MESSAGE_DELAY_SECS: i64 = 600;

/// Sentinel quality for things whose observations arrive too late to
/// verify.
pub const QUALITY_UNKNOWN: f64 = -1.0;

#[derive(Debug, Default)]
struct Samples {
    predicted: Vec<u8>,
    actual: Vec<u8>,
}

pub struct QualityTracker {
    catalog: Arc<Catalog>,
    registry: Arc<CycleRegistry>,
    publisher: Arc<PredictionPublisher>,
    samples: DashMap<String, Samples>,
    qualities: DashMap<String, f64>,
}

impl QualityTracker {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<CycleRegistry>,
        publisher: Arc<PredictionPublisher>,
    ) -> Self {
        QualityTracker {
            catalog,
            registry,
            publisher,
            samples: DashMap::new(),
            qualities: DashMap::new(),
        }
    }

    /// The rolling accuracy for a thing, 0..=1, or [`QUALITY_UNKNOWN`].
    pub fn quality(&self, thing: &str) -> Option<f64> {
        self.qualities.get(thing).map(|quality| *quality)
    }

    fn evaluate(&self, thing: &str) {
        let Some(observation) = self.registry.current_primary_signal(thing) else {
            return;
        };
        let delay = observation.received_time - observation.phenomenon_time;
        if delay > Duration::seconds(MAX_MESSAGE_DELAY_SECS) {
            self.qualities.insert(thing.to_string(), QUALITY_UNKNOWN);
            return;
        }

        let Some(prediction) = self.publisher.current(thing) else {
            return;
        };

        // Compare what the prediction said for this moment, compensated by
        // the delay the observations take to reach us.
        let delayed_now = Utc::now() - delay;
        let seconds = (delayed_now - prediction.reference_time)
            .num_seconds()
            .abs();
        let Some(predicted) = prediction.color_at(seconds) else {
            return;
        };

        let quality = self.record(thing, predicted, observation.result);
        debug!("Prediction quality for {thing}: {quality:.2}");
    }

    /// Push one (predicted, actual) pair and return the updated accuracy.
    fn record(&self, thing: &str, predicted: u8, actual: u8) -> f64 {
        let mut samples = self.samples.entry(thing.to_string()).or_default();
        samples.predicted.push(predicted);
        samples.actual.push(actual);
        if samples.predicted.len() > SAMPLE_WINDOW {
            samples.predicted.remove(0);
            samples.actual.remove(0);
        }
        let correct = samples
            .predicted
            .iter()
            .zip(samples.actual.iter())
            .filter(|(p, a)| p == a)
            .count();
        let quality = correct as f64 / samples.predicted.len() as f64;
        drop(samples);
        self.qualities.insert(thing.to_string(), quality);
        quality
    }

    /// Evaluate every known thing, once per second, forever.
    pub async fn run(self: Arc<Self>) {
        loop {
            for thing in self.catalog.thing_names() {
                self.evaluate(&thing);
            }
            tokio::time::sleep(StdDuration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::history::HistoryStore;

    fn tracker() -> QualityTracker {
        let catalog = Arc::new(Catalog::new("https://tld.example.com/v1.1/").unwrap());
        let registry = Arc::new(CycleRegistry::new());
        let store = Arc::new(HistoryStore::new(
            std::env::temp_dir().join("signal-predictor-quality"),
            registry.clone(),
        ));
        let config = Config {
            static_path: std::env::temp_dir().join("signal-predictor-quality"),
            sensorthings_url: "https://tld.example.com/v1.1/".to_string(),
            sensorthings_mqtt_url: "tcp://localhost:1883".to_string(),
            prediction_mqtt_url: "tcp://localhost:1883".to_string(),
            prediction_mqtt_username: None,
            prediction_mqtt_password: None,
        };
        let publisher =
            PredictionPublisher::connect(&config, store, registry.clone(), catalog.clone())
                .unwrap();
        QualityTracker::new(catalog, registry, publisher)
    }

    #[tokio::test]
    async fn test_record_tracks_the_rolling_accuracy() {
        let tracker = tracker();
        assert_eq!(tracker.record("271_31", 3, 3), 1.0);
        assert_eq!(tracker.record("271_31", 3, 1), 0.5);
        assert_eq!(tracker.record("271_31", 1, 1), 2.0 / 3.0);
        assert_eq!(tracker.quality("271_31"), Some(2.0 / 3.0));
    }

    #[tokio::test]
    async fn test_record_bounds_the_sample_window() {
        let tracker = tracker();
        for _ in 0..SAMPLE_WINDOW {
            tracker.record("271_31", 1, 2);
        }
        assert_eq!(tracker.quality("271_31"), Some(0.0));
        // Once the wrong guesses age out, the accuracy recovers fully.
        for _ in 0..SAMPLE_WINDOW {
            tracker.record("271_31", 1, 1);
        }
        assert_eq!(tracker.quality("271_31"), Some(1.0));
    }
}
