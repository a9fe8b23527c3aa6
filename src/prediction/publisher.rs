// src/prediction/publisher.rs
//
// Publishes the best available prediction per thing to the prediction
// broker, deduplicated and rate limited. The most recent published
// prediction per thing is kept in memory for the monitor and the quality
// evaluation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::history::HistoryStore;
use crate::registry::CycleRegistry;

use super::{engine, Prediction};

/// Gap between two publish waves.
const REPUBLISH_GAP: StdDuration = StdDuration::from_millis(500);

/// A fresh prediction whose reference time moved less than this is noise
/// from rapid-fire callbacks, not new information.
const MIN_REFERENCE_STEP_MS: i64 = 1_000;

pub struct PredictionPublisher {
    store: Arc<HistoryStore>,
    registry: Arc<CycleRegistry>,
    catalog: Arc<Catalog>,
    client: AsyncClient,
    static_path: PathBuf,
    /// The most recent published prediction by thing name.
    current: DashMap<String, Prediction>,
    /// When the prediction for a thing was last published.
    times: DashMap<String, DateTime<Utc>>,
    /// Per-thing locks so one thing computes at most one prediction at a
    /// time. Parallel things publish freely.
    locks: DashMap<String, Arc<Mutex<()>>>,
    requested: AtomicU64,
    published: AtomicU64,
    cancelled: AtomicU64,
}

impl PredictionPublisher {
    /// Connect to the prediction broker and spawn its connection driver.
    pub fn connect(
        config: &Config,
        store: Arc<HistoryStore>,
        registry: Arc<CycleRegistry>,
        catalog: Arc<Catalog>,
    ) -> anyhow::Result<Arc<Self>> {
        info!(
            "Connecting to prediction broker at {}",
            config.prediction_mqtt_url
        );
        let credentials = match (
            config.prediction_mqtt_username.as_deref(),
            config.prediction_mqtt_password.as_deref(),
        ) {
            (Some(username), password) => Some((username, password.unwrap_or(""))),
            _ => None,
        };
        let options = broker::options(
            &config.prediction_mqtt_url,
            "signal-predictor",
            credentials,
        )?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    warn!("Connection to prediction broker lost: {err}");
                    tokio::time::sleep(StdDuration::from_secs(5)).await;
                }
            }
        });

        Ok(Arc::new(PredictionPublisher {
            store,
            registry,
            catalog,
            client,
            static_path: config.static_path.clone(),
            current: DashMap::new(),
            times: DashMap::new(),
            locks: DashMap::new(),
            requested: AtomicU64::new(0),
            published: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }))
    }

    /// The most recent published prediction for a thing.
    pub fn current(&self, thing: &str) -> Option<Prediction> {
        self.current.get(thing).map(|prediction| prediction.clone())
    }

    /// When the prediction for a thing was last published.
    pub fn last_published(&self, thing: &str) -> Option<DateTime<Utc>> {
        self.times.get(thing).map(|time| *time)
    }

    pub fn prediction_count(&self) -> usize {
        self.current.len()
    }

    pub fn for_each_current(&self, mut visit: impl FnMut(&Prediction)) {
        for entry in self.current.iter() {
            visit(entry.value());
        }
    }

    /// (requested, published, cancelled)
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.requested.load(Ordering::Relaxed),
            self.published.load(Ordering::Relaxed),
            self.cancelled.load(Ordering::Relaxed),
        )
    }

    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Compute and publish the best prediction for a thing. Predictions
    /// that would not tell subscribers anything new are dropped, as are
    /// predictions arriving within [`MIN_REFERENCE_STEP_MS`] of the current
    /// one.
    pub async fn publish_best(&self, thing: &str) {
        let lock = self.locks.entry(thing.to_string()).or_default().clone();
        let _guard = lock.lock().await;

        self.requested.fetch_add(1, Ordering::Relaxed);

        let prediction = match engine::predict(&self.store, &self.registry, thing).await {
            Ok(prediction) => prediction,
            Err(err) => {
                debug!("No prediction for {thing}: {err}");
                self.cancel();
                return;
            }
        };

        if let Some(previous) = self.current.get(thing) {
            if skip_publish(&previous, &prediction) {
                self.cancel();
                return;
            }
        }

        let payload = match serde_json::to_vec(&prediction) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Could not encode prediction for {thing}: {err}");
                self.cancel();
                return;
            }
        };

        // Keep the last published prediction on disk for the dashboards.
        if let Err(err) = self.write_prediction_file(&prediction, &payload).await {
            error!("Could not write prediction file for {thing}: {err}");
            self.cancel();
            return;
        }
        let topic = format!("prediction/{thing}");
        if let Err(err) = self
            .client
            .publish(topic, QoS::ExactlyOnce, true, payload)
            .await
        {
            error!("Could not publish prediction for {thing}: {err}");
            self.cancel();
            return;
        }

        self.current.insert(thing.to_string(), prediction);
        self.times.insert(thing.to_string(), Utc::now());

        let published = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        if published % 1000 == 0 {
            let (requested, _, cancelled) = self.counters();
            info!(
                "Predictions requested {requested}, \
                 published {published}, cancelled {cancelled}"
            );
        }
    }

    async fn write_prediction_file(
        &self,
        prediction: &Prediction,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let file = match prediction.program_id {
            Some(program) => format!("{}-P{program}.json", prediction.thing_name),
            None => format!("{}.json", prediction.thing_name),
        };
        let path = self.static_path.join("predictions").join(file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, payload).await
    }

    /// Publish the best predictions for all things, in parallel.
    pub async fn publish_all_best(self: &Arc<Self>) {
        let mut wave = JoinSet::new();
        for thing in self.catalog.thing_names() {
            let publisher = self.clone();
            wave.spawn(async move { publisher.publish_best(&thing).await });
        }
        while wave.join_next().await.is_some() {}
    }

    /// Publish waves forever, with a short gap in between.
    pub async fn publish_all_best_periodically(self: Arc<Self>) {
        loop {
            self.publish_all_best().await;
            tokio::time::sleep(REPUBLISH_GAP).await;
        }
    }
}

/// Whether publishing `next` over `previous` would be wasted work: either
/// the content is the same, or the reference time barely moved.
fn skip_publish(previous: &Prediction, next: &Prediction) -> bool {
    if next.matches(previous) {
        return true;
    }
    (next.reference_time - previous.reference_time)
        .num_milliseconds()
        .abs()
        < MIN_REFERENCE_STEP_MS
}
