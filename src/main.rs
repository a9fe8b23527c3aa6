mod broker;
mod catalog;
mod config;
mod cycle;
mod history;
mod ingest;
mod monitor;
mod observation;
mod phases;
mod prediction;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use catalog::Catalog;
use config::Config;
use history::{HistoryStore, HistoryUpdater};
use ingest::Callbacks;
use monitor::Monitor;
use prediction::{PredictionPublisher, QualityTracker};
use registry::CycleRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("signal_predictor=info,rumqttc=warn")),
        )
        .init();

    info!("🚦 Signal phase predictor starting");

    let config = Config::from_env()?;
    info!("✓ Configuration loaded");

    // Sync the catalog of signal groups and their datastream topics.
    let catalog = Arc::new(Catalog::new(&config.sensorthings_url)?);
    catalog.sync().await?;

    let registry = Arc::new(CycleRegistry::new());
    let store = Arc::new(HistoryStore::new(&config.static_path, registry.clone()));

    // Write the history index once for the cycle visualizer, then keep it
    // fresh periodically.
    store.write_index().await?;
    {
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                if let Err(err) = store.write_index().await {
                    tracing::error!("Could not write history index: {err}");
                }
            }
        });
    }

    // Seed the program cycles so program-specific histories can be picked
    // right away.
    catalog.prefetch_programs(&registry).await?;

    // Connect the prediction publisher.
    let publisher =
        PredictionPublisher::connect(&config, store.clone(), registry.clone(), catalog.clone())?;
    let updater = Arc::new(HistoryUpdater::new(store.clone()));

    // Wire up what happens after an observation was filed: color and
    // program changes refresh the prediction; detector hits carry no
    // predictive signal on their own; a cycle tick archives the completed
    // cycle and then refreshes the prediction.
    let republish = |publisher: Arc<PredictionPublisher>| {
        Arc::new(move |thing: String| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher.publish_best(&thing).await;
            });
        })
    };
    let noop = Arc::new(|_thing: String| {});
    let on_cycle_tick = {
        let publisher = publisher.clone();
        let updater = updater.clone();
        Arc::new(move |tick: ingest::CycleTick| {
            let publisher = publisher.clone();
            let updater = updater.clone();
            tokio::spawn(async move {
                let updated = updater
                    .update(
                        &tick.thing,
                        tick.start_time,
                        tick.end_time,
                        &tick.primary_signal,
                        &tick.signal_program,
                        &tick.detector_car,
                        &tick.detector_bike,
                    )
                    .await;
                if updated.is_ok() {
                    publisher.publish_best(&tick.thing).await;
                }
            });
        })
    };
    let callbacks = Callbacks {
        primary_signal: republish(publisher.clone()),
        signal_program: republish(publisher.clone()),
        detector_car: noop.clone(),
        detector_bike: noop,
        cycle_tick: on_cycle_tick,
    };

    // Connect to the observation broker and start routing messages.
    let dispatcher = Arc::new(ingest::Dispatcher::new(
        catalog.clone(),
        registry.clone(),
        callbacks,
    ));
    ingest::connect(&config, dispatcher.clone()).await?;

    // Keep memory bounded even when upstreams get stuck.
    tokio::spawn(ingest::run_cleanup(registry.clone()));

    // Publish all predictions once, then keep republishing periodically.
    publisher.publish_all_best().await;
    tokio::spawn(publisher.clone().publish_all_best_periodically());

    // Track how well the published predictions hold up.
    let quality = Arc::new(QualityTracker::new(
        catalog.clone(),
        registry.clone(),
        publisher.clone(),
    ));
    tokio::spawn(quality.clone().run());

    // Dashboard artifacts, once at startup and then periodically.
    let monitor = Arc::new(Monitor::new(
        config.static_path.clone(),
        catalog,
        registry,
        publisher,
        updater,
        dispatcher.stats.clone(),
        quality,
    ));
    monitor.write_all().await;
    tokio::spawn(monitor.clone().run());

    info!("✓ All systems running");

    // Park on the receipt watcher: a silent broker is fatal, the
    // orchestrator restarts us with a fresh connection.
    let err = ingest::watch_receipts(dispatcher.stats.clone()).await;
    Err(err)
}
