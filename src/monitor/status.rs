// src/monitor/status.rs
//
// Status artifacts for the dashboards: one summary over all predictions
// and one small status file per signal group.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::prediction::Prediction;

use super::Monitor;

/// A summary of all predictions, i.e. whether they are up to date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub status_update_time: i64,
    pub num_things: usize,
    pub num_predictions: usize,
    /// Predictions with an average quality at or below 50 percent.
    pub num_bad_predictions: usize,
    pub most_recent_prediction_time: Option<i64>,
    pub oldest_prediction_time: Option<i64>,
    pub average_prediction_quality: Option<f64>,
}

/// The status of a single signal group.
#[derive(Debug, Clone, Serialize)]
pub struct SgStatus {
    pub status_update_time: i64,
    pub thing_name: String,
    pub prediction_quality: Option<f64>,
    pub prediction_time: Option<i64>,
}

fn summarize(num_things: usize, predictions: &[Prediction], now: i64) -> StatusSummary {
    let mut most_recent: Option<i64> = None;
    let mut oldest: Option<i64> = None;
    let mut quality_sum = 0.0;
    let mut num_bad = 0;
    for prediction in predictions {
        let time = prediction.reference_time.timestamp();
        most_recent = Some(most_recent.map_or(time, |t| t.max(time)));
        oldest = Some(oldest.map_or(time, |t| t.min(time)));

        let quality = prediction.average_quality() / 100.0;
        if quality <= 0.5 {
            num_bad += 1;
        }
        if (0.0..=1.0).contains(&quality) {
            quality_sum += quality;
        }
    }
    let average = if predictions.is_empty() {
        None
    } else {
        Some(quality_sum / predictions.len() as f64)
    };
    StatusSummary {
        status_update_time: now,
        num_things,
        num_predictions: predictions.len(),
        num_bad_predictions: num_bad,
        most_recent_prediction_time: most_recent,
        oldest_prediction_time: oldest,
        average_prediction_quality: average,
    }
}

impl Monitor {
    /// Write `status/status.json`.
    pub(super) async fn write_summary(&self) -> Result<()> {
        let mut predictions = Vec::with_capacity(self.publisher.prediction_count());
        self.publisher
            .for_each_current(|prediction| predictions.push(prediction.clone()));
        let summary = summarize(
            self.catalog.thing_count(),
            &predictions,
            Utc::now().timestamp(),
        );

        let _guard = self.status_lock.lock().await;
        let path = self.static_path.join("status").join("status.json");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec(&summary)?).await?;
        Ok(())
    }

    /// Write `status/<thing-topic>/status.json` for every signal group.
    pub(super) async fn write_sg_statuses(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut statuses: Vec<(String, SgStatus)> = Vec::new();
        self.catalog.for_each_thing(|thing| {
            let prediction = self.publisher.current(&thing.name);
            statuses.push((
                thing.topic(),
                SgStatus {
                    status_update_time: now,
                    thing_name: thing.name.clone(),
                    prediction_quality: prediction
                        .as_ref()
                        .map(|p| p.average_quality() / 100.0),
                    prediction_time: prediction.map(|p| p.reference_time.timestamp()),
                },
            ));
        });

        let _guard = self.status_lock.lock().await;
        for (topic, status) in statuses {
            let path = self
                .static_path
                .join("status")
                .join(topic)
                .join("status.json");
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, serde_json::to_vec(&status)?).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn prediction(reference_secs: i64, quality: u8) -> Prediction {
        Prediction {
            thing_name: "271_31".to_string(),
            now: vec![3, 3],
            now_quality: vec![quality, quality],
            then: vec![1, 1],
            then_quality: vec![quality, quality],
            reference_time: Utc.timestamp_opt(reference_secs, 0).unwrap(),
            program_id: None,
        }
    }

    #[test]
    fn test_summarize_without_predictions() {
        let summary = summarize(12, &[], 1000);
        assert_eq!(
            summary,
            StatusSummary {
                status_update_time: 1000,
                num_things: 12,
                num_predictions: 0,
                num_bad_predictions: 0,
                most_recent_prediction_time: None,
                oldest_prediction_time: None,
                average_prediction_quality: None,
            }
        );
    }

    #[test]
    fn test_summarize_tracks_extremes_and_bad_predictions() {
        let predictions = vec![
            prediction(100, 90),
            prediction(300, 30),
            prediction(200, 70),
        ];
        let summary = summarize(3, &predictions, 1000);
        assert_eq!(summary.num_predictions, 3);
        assert_eq!(summary.most_recent_prediction_time, Some(300));
        assert_eq!(summary.oldest_prediction_time, Some(100));
        assert_eq!(summary.num_bad_predictions, 1);
        let average = summary.average_prediction_quality.unwrap();
        assert!((average - (0.9 + 0.3 + 0.7) / 3.0).abs() < 1e-9);
    }
}
