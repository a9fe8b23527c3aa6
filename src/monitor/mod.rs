// src/monitor/mod.rs
//
// Dashboard artifacts: a status summary over all predictions, a status file
// per signal group, and service metrics in JSON and Prometheus text form.
// Everything is written under the static path on a fixed period.

mod metrics;
mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::Mutex;
use tracing::error;

use crate::catalog::Catalog;
use crate::history::HistoryUpdater;
use crate::ingest::IngestStats;
use crate::prediction::{PredictionPublisher, QualityTracker};
use crate::registry::CycleRegistry;

const WRITE_PERIOD: StdDuration = StdDuration::from_secs(30);

pub struct Monitor {
    static_path: PathBuf,
    catalog: Arc<Catalog>,
    registry: Arc<CycleRegistry>,
    publisher: Arc<PredictionPublisher>,
    updater: Arc<HistoryUpdater>,
    ingest: Arc<IngestStats>,
    quality: Arc<QualityTracker>,
    status_lock: Mutex<()>,
    metrics_lock: Mutex<()>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        static_path: PathBuf,
        catalog: Arc<Catalog>,
        registry: Arc<CycleRegistry>,
        publisher: Arc<PredictionPublisher>,
        updater: Arc<HistoryUpdater>,
        ingest: Arc<IngestStats>,
        quality: Arc<QualityTracker>,
    ) -> Self {
        Monitor {
            static_path,
            catalog,
            registry,
            publisher,
            updater,
            ingest,
            quality,
            status_lock: Mutex::new(()),
            metrics_lock: Mutex::new(()),
        }
    }

    /// Write every artifact once. Failures are logged per artifact; a
    /// broken dashboard never disturbs the prediction pipeline.
    pub async fn write_all(&self) {
        if let Err(err) = self.write_summary().await {
            error!("Could not write status summary: {err}");
        }
        if let Err(err) = self.write_sg_statuses().await {
            error!("Could not write signal group statuses: {err}");
        }
        if let Err(err) = self.write_metrics().await {
            error!("Could not write metrics: {err}");
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(WRITE_PERIOD).await;
            self.write_all().await;
        }
    }
}
