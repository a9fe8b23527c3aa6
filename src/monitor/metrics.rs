// src/monitor/metrics.rs
//
// Service metrics: a per-thing table plus the pipeline counters, written
// as `metrics.json` and as a Prometheus text rendition in `metrics.txt`.

use std::sync::atomic::Ordering;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use super::Monitor;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsEntry {
    /// The name of the thing.
    pub name: String,
    /// The color the signal actually shows right now.
    pub actual: Option<u8>,
    /// The color the current prediction claims for right now.
    pub predicted: Option<u8>,
    /// The rolling prediction accuracy, 0..=100.
    pub quality: Option<u8>,
    /// The program the controller currently reports.
    pub program: Option<u8>,
    /// Seconds since the prediction was last published.
    pub age: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub entries: Vec<MetricsEntry>,
    /// Things that report their color and have a prediction.
    pub verifiable: usize,
    /// Verifiable things whose predicted color is currently correct.
    pub correct: usize,
    #[serde(rename = "observationsReceived")]
    pub observations_received: u64,
    #[serde(rename = "observationsProcessed")]
    pub observations_processed: u64,
    #[serde(rename = "observationsCancelled")]
    pub observations_cancelled: u64,
    #[serde(rename = "historyUpdatesRequested")]
    pub history_updates_requested: u64,
    #[serde(rename = "historyUpdatesProcessed")]
    pub history_updates_processed: u64,
    #[serde(rename = "historyUpdatesCancelled")]
    pub history_updates_cancelled: u64,
    #[serde(rename = "predictionsRequested")]
    pub predictions_requested: u64,
    #[serde(rename = "predictionsPublished")]
    pub predictions_published: u64,
    #[serde(rename = "predictionsCancelled")]
    pub predictions_cancelled: u64,
}

fn render_text(metrics: &Metrics) -> String {
    let gauges = [
        ("predictor_things", metrics.entries.len() as u64),
        ("predictor_verifiable", metrics.verifiable as u64),
        ("predictor_correct", metrics.correct as u64),
        (
            "predictor_observations_received",
            metrics.observations_received,
        ),
        (
            "predictor_observations_processed",
            metrics.observations_processed,
        ),
        (
            "predictor_observations_cancelled",
            metrics.observations_cancelled,
        ),
        (
            "predictor_history_updates_requested",
            metrics.history_updates_requested,
        ),
        (
            "predictor_history_updates_processed",
            metrics.history_updates_processed,
        ),
        (
            "predictor_history_updates_cancelled",
            metrics.history_updates_cancelled,
        ),
        (
            "predictor_predictions_requested",
            metrics.predictions_requested,
        ),
        (
            "predictor_predictions_published",
            metrics.predictions_published,
        ),
        (
            "predictor_predictions_cancelled",
            metrics.predictions_cancelled,
        ),
    ];
    let mut text = String::new();
    for (name, value) in gauges {
        text.push_str(&format!("{name} {value}\n"));
    }
    text
}

impl Monitor {
    fn collect(&self) -> Metrics {
        let now = Utc::now();
        let mut entries = Vec::with_capacity(self.catalog.thing_count());
        let mut verifiable = 0;
        let mut correct = 0;
        self.catalog.for_each_thing(|thing| {
            let actual = self
                .registry
                .current_primary_signal(&thing.name)
                .map(|observation| observation.result);
            let predicted = self.publisher.current(&thing.name).and_then(|prediction| {
                let seconds = (now - prediction.reference_time).num_seconds().abs();
                prediction.color_at(seconds)
            });
            if let (Some(actual), Some(predicted)) = (actual, predicted) {
                verifiable += 1;
                if actual == predicted {
                    correct += 1;
                }
            }
            let quality = self
                .quality
                .quality(&thing.name)
                .filter(|quality| (0.0..=1.0).contains(quality))
                .map(|quality| (quality * 100.0).round() as u8);
            entries.push(MetricsEntry {
                name: thing.name.clone(),
                actual,
                predicted,
                quality,
                program: self
                    .registry
                    .current_program(&thing.name)
                    .map(|observation| observation.result),
                age: self
                    .publisher
                    .last_published(&thing.name)
                    .map(|time| (now - time).num_seconds()),
            });
        });

        let (observations_received, observations_processed, observations_cancelled) = (
            self.ingest.received.load(Ordering::Relaxed),
            self.ingest.processed.load(Ordering::Relaxed),
            self.ingest.cancelled.load(Ordering::Relaxed),
        );
        let (history_requested, history_processed, history_cancelled) = self.updater.counters();
        let (predictions_requested, predictions_published, predictions_cancelled) =
            self.publisher.counters();

        Metrics {
            entries,
            verifiable,
            correct,
            observations_received,
            observations_processed,
            observations_cancelled,
            history_updates_requested: history_requested,
            history_updates_processed: history_processed,
            history_updates_cancelled: history_cancelled,
            predictions_requested,
            predictions_published,
            predictions_cancelled,
        }
    }

    /// Write `metrics.json` and `metrics.txt`.
    pub(super) async fn write_metrics(&self) -> Result<()> {
        let metrics = self.collect();
        let _guard = self.metrics_lock.lock().await;
        tokio::fs::create_dir_all(&self.static_path).await?;
        tokio::fs::write(
            self.static_path.join("metrics.json"),
            serde_json::to_vec(&metrics)?,
        )
        .await?;
        tokio::fs::write(
            self.static_path.join("metrics.txt"),
            render_text(&metrics).as_bytes(),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text_emits_one_gauge_per_line() {
        let metrics = Metrics {
            entries: vec![],
            verifiable: 3,
            correct: 2,
            observations_received: 100,
            observations_processed: 90,
            observations_cancelled: 10,
            history_updates_requested: 5,
            history_updates_processed: 5,
            history_updates_cancelled: 0,
            predictions_requested: 7,
            predictions_published: 6,
            predictions_cancelled: 1,
        };
        let text = render_text(&metrics);
        assert!(text.contains("predictor_things 0\n"));
        assert!(text.contains("predictor_verifiable 3\n"));
        assert!(text.contains("predictor_observations_received 100\n"));
        assert!(text.contains("predictor_predictions_published 6\n"));
        assert_eq!(text.lines().count(), 12);
    }
}
