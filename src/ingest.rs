// src/ingest.rs
//
// The observation ingest path: subscribe to every datastream topic, route
// each inbound message to the right cycle, and rotate all five cycles of a
// thing when its cycle tick arrives. Stream callbacks run detached so a
// slow prediction never blocks the broker connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, Packet, QoS, SubscribeFilter};
use tracing::{error, info, warn};

use crate::broker;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::cycle::{Cycle, CycleError, CycleSnapshot};
use crate::observation::{validate, Observation, StreamKind};
use crate::registry::CycleRegistry;

/// The grid cycle boundaries are snapped to, in milliseconds. Upstream
/// controllers complete cycles with a jitter of one or two seconds; left
/// alone, that jitter would shift every extrapolated prediction a little
/// more each cycle.
const RASTER_MS: i64 = 5_000;

/// How many pending observations each stream may hold between cleanups.
/// Detectors fire continuously and need room; the others are sparse.
fn pending_cap(kind: StreamKind) -> usize {
    match kind {
        StreamKind::PrimarySignal => 20,
        StreamKind::SignalProgram => 5,
        StreamKind::CycleSecond => 5,
        StreamKind::DetectorCar => 300,
        StreamKind::DetectorBike => 300,
    }
}

/// Snap a time to the nearest raster boundary, rounding half up.
pub fn round_to_raster(time: DateTime<Utc>) -> DateTime<Utc> {
    let remainder = time.timestamp_millis().rem_euclid(RASTER_MS);
    let down = time - Duration::milliseconds(remainder);
    if remainder < RASTER_MS / 2 {
        down
    } else {
        down + Duration::milliseconds(RASTER_MS)
    }
}

/// Everything a completed rotation hands to the cycle tick callback.
#[derive(Debug, Clone)]
pub struct CycleTick {
    pub thing: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub primary_signal: CycleSnapshot,
    pub signal_program: CycleSnapshot,
    pub cycle_second: CycleSnapshot,
    pub detector_car: CycleSnapshot,
    pub detector_bike: CycleSnapshot,
}

type StreamCallback = Arc<dyn Fn(String) + Send + Sync>;
type TickCallback = Arc<dyn Fn(CycleTick) + Send + Sync>;

/// Callbacks fired after an observation was filed. Each implementation is
/// expected to spawn its own work; the dispatcher calls them inline.
pub struct Callbacks {
    pub primary_signal: StreamCallback,
    pub signal_program: StreamCallback,
    pub detector_car: StreamCallback,
    pub detector_bike: StreamCallback,
    pub cycle_tick: TickCallback,
}

impl Callbacks {
    fn for_stream(&self, kind: StreamKind) -> Option<&StreamCallback> {
        match kind {
            StreamKind::PrimarySignal => Some(&self.primary_signal),
            StreamKind::SignalProgram => Some(&self.signal_program),
            StreamKind::DetectorCar => Some(&self.detector_car),
            StreamKind::DetectorBike => Some(&self.detector_bike),
            StreamKind::CycleSecond => None,
        }
    }
}

/// Message counters, shared with the liveness watcher and the monitor.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub cancelled: AtomicU64,
    received_by_kind: DashMap<StreamKind, u64>,
}

impl IngestStats {
    fn count_kind(&self, kind: StreamKind) {
        *self.received_by_kind.entry(kind).or_insert(0) += 1;
    }

    fn drain_by_kind(&self) -> Vec<(StreamKind, u64)> {
        let counts: Vec<_> = self
            .received_by_kind
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        self.received_by_kind.clear();
        counts
    }
}

/// Routes inbound observations into the cycle registry.
pub struct Dispatcher {
    catalog: Arc<Catalog>,
    registry: Arc<CycleRegistry>,
    callbacks: Callbacks,
    pub stats: Arc<IngestStats>,
}

impl Dispatcher {
    pub fn new(catalog: Arc<Catalog>, registry: Arc<CycleRegistry>, callbacks: Callbacks) -> Self {
        Dispatcher {
            catalog,
            registry,
            callbacks,
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Handle one inbound broker message. Messages on unknown topics, with
    /// undecodable payloads or stale observations are dropped.
    pub fn process(&self, topic: &str, payload: &[u8]) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let Some(route) = self.catalog.route(topic) else {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.stats.count_kind(route.kind);

        let observation: Observation = match serde_json::from_slice(payload) {
            Ok(observation) => observation,
            Err(_) => {
                // Some other payload on the datastream that we don't care
                // about.
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Err(err) = validate(&observation, route.kind) {
            warn!("Invalid observation: {err}");
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let cycle = self.registry.get_or_create(route.kind, &route.thing);
        cycle.add(observation);

        if route.kind == StreamKind::CycleSecond {
            if self.rotate(&route.thing, observation, &cycle).is_err() {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
        } else if let Some(callback) = self.callbacks.for_stream(route.kind) {
            callback(route.thing.clone());
        }

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A cycle tick arrived: rotate all five cycles of the thing over the
    /// same window and hand the snapshots to the tick callback. The window
    /// boundaries are snapped to the raster.
    ///
    /// The rotations take each cycle's lock in turn, not atomically across
    /// streams; the snapshots may differ by an in-flight observation, which
    /// the history builder tolerates.
    fn rotate(
        &self,
        thing: &str,
        observation: Observation,
        cycle_second: &Arc<Cycle>,
    ) -> Result<(), CycleError> {
        // All cycles share the timeframe of the cycle second stream.
        let start_time = cycle_second.end_time().map(round_to_raster);
        let end_time = Some(round_to_raster(observation.phenomenon_time));

        let cycle_second_snapshot = cycle_second.complete(start_time, end_time)?;
        let primary_signal = self
            .registry
            .get_or_create(StreamKind::PrimarySignal, thing)
            .complete(start_time, end_time)?;
        let signal_program = self
            .registry
            .get_or_create(StreamKind::SignalProgram, thing)
            .complete(start_time, end_time)?;
        let detector_car = self
            .registry
            .get_or_create(StreamKind::DetectorCar, thing)
            .complete(start_time, end_time)?;
        let detector_bike = self
            .registry
            .get_or_create(StreamKind::DetectorBike, thing)
            .complete(start_time, end_time)?;

        (self.callbacks.cycle_tick)(CycleTick {
            thing: thing.to_string(),
            // Both boundaries are present, the rotations above succeeded.
            start_time: start_time.ok_or(CycleError::NotYetComplete)?,
            end_time: end_time.ok_or(CycleError::NotYetComplete)?,
            primary_signal,
            signal_program,
            cycle_second: cycle_second_snapshot,
            detector_car,
            detector_bike,
        });
        Ok(())
    }
}

/// Connect to the observation broker and subscribe to every datastream
/// topic. Subscriptions are re-established on every reconnect.
pub async fn connect(config: &Config, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    info!(
        "Connecting to observation broker at {}",
        config.sensorthings_mqtt_url
    );
    let options = broker::options(
        &config.sensorthings_mqtt_url,
        "signal-predictor-ingest",
        None,
    )?;
    let (client, mut eventloop) = AsyncClient::new(options, 1024);

    let filters: Vec<SubscribeFilter> = dispatcher
        .catalog
        .topics()
        .into_iter()
        .map(|topic| SubscribeFilter::new(topic, QoS::AtLeastOnce))
        .collect();
    if filters.is_empty() {
        return Err(anyhow!("no datastream topics to subscribe to"));
    }
    info!("Subscribing to {} datastream topics.", filters.len());

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to observation broker.");
                    let client = client.clone();
                    let filters = filters.clone();
                    tokio::spawn(async move {
                        for chunk in filters.chunks(1000) {
                            if let Err(err) = client.subscribe_many(chunk.to_vec()).await {
                                error!("Could not subscribe to datastreams: {err}");
                                return;
                            }
                        }
                        info!("Subscribed to all datastreams.");
                    });
                }
                Ok(Event::Incoming(Packet::Publish(message))) => {
                    dispatcher.process(&message.topic, &message.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("Connection to observation broker lost: {err}");
                    tokio::time::sleep(StdDuration::from_secs(1)).await;
                }
            }
        }
    });
    Ok(())
}

/// Truncate every cycle's pending bucket to its cap, once a minute, so a
/// stuck upstream cannot grow memory without bound.
pub async fn run_cleanup(registry: Arc<CycleRegistry>) {
    loop {
        tokio::time::sleep(StdDuration::from_secs(60)).await;
        for kind in StreamKind::ALL {
            let cap = pending_cap(kind);
            registry.for_each(kind, |_, cycle| cycle.truncate_pending(cap));
        }
    }
}

/// Watch the receive counter. A full minute without a single observation
/// means the broker connection is silently dead; the returned error is
/// fatal so the process restarts with a fresh connection.
pub async fn watch_receipts(stats: Arc<IngestStats>) -> anyhow::Error {
    let mut last = (0u64, 0u64, 0u64);
    loop {
        tokio::time::sleep(StdDuration::from_secs(60)).await;
        let received = stats.received.load(Ordering::Relaxed);
        let processed = stats.processed.load(Ordering::Relaxed);
        let cancelled = stats.cancelled.load(Ordering::Relaxed);
        if received == last.0 {
            return anyhow!("no observations received in the last 60 seconds");
        }
        info!(
            "Received {} observations in the last 60 seconds ({} processed, {} cancelled).",
            received - last.0,
            processed - last.1,
            cancelled - last.2,
        );
        for (kind, count) in stats.drain_by_kind() {
            info!("  - Received {count} observations for `{}`.", kind.layer_name());
        }
        last = (received, processed, cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_to_raster_snaps_to_the_nearest_five_seconds() {
        let time = Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 56).unwrap()
            + Duration::milliseconds(123);
        assert_eq!(
            round_to_raster(time),
            Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 55).unwrap()
        );

        let time = Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 51).unwrap();
        assert_eq!(
            round_to_raster(time),
            Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 50).unwrap()
        );

        let time = Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 58).unwrap()
            + Duration::milliseconds(123);
        assert_eq!(
            round_to_raster(time),
            Utc.with_ymd_and_hms(2023, 3, 8, 12, 35, 0).unwrap()
        );

        // Exactly on the grid stays put.
        let time = Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 55).unwrap();
        assert_eq!(round_to_raster(time), time);

        // The midpoint rounds up.
        let time = Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 52).unwrap()
            + Duration::milliseconds(500);
        assert_eq!(
            round_to_raster(time),
            Utc.with_ymd_and_hms(2023, 3, 8, 12, 34, 55).unwrap()
        );
    }

    #[test]
    fn test_pending_caps_per_stream() {
        assert_eq!(pending_cap(StreamKind::PrimarySignal), 20);
        assert_eq!(pending_cap(StreamKind::SignalProgram), 5);
        assert_eq!(pending_cap(StreamKind::CycleSecond), 5);
        assert_eq!(pending_cap(StreamKind::DetectorCar), 300);
        assert_eq!(pending_cap(StreamKind::DetectorBike), 300);
    }

    fn test_dispatcher() -> (Arc<Dispatcher>, Arc<parking_lot::Mutex<Vec<CycleTick>>>) {
        let catalog = Arc::new(Catalog::new("https://tld.example.com/v1.1/").unwrap());
        catalog.register(
            serde_json::from_str(
                r#"{
                    "@iot.id": 17,
                    "name": "271_31",
                    "properties": {"laneType": "Radfahrer", "trafficLightsId": "271"},
                    "Datastreams": [
                        {"@iot.id": 100, "properties": {"layerName": "primary_signal"}},
                        {"@iot.id": 101, "properties": {"layerName": "cycle_second"}}
                    ]
                }"#,
            )
            .unwrap(),
        );
        let ticks: Arc<parking_lot::Mutex<Vec<CycleTick>>> = Arc::default();
        let recorded = ticks.clone();
        let noop: StreamCallback = Arc::new(|_| {});
        let callbacks = Callbacks {
            primary_signal: noop.clone(),
            signal_program: noop.clone(),
            detector_car: noop.clone(),
            detector_bike: noop,
            cycle_tick: Arc::new(move |tick| recorded.lock().push(tick)),
        };
        let registry = Arc::new(CycleRegistry::new());
        (
            Arc::new(Dispatcher::new(catalog, registry, callbacks)),
            ticks,
        )
    }

    fn payload(time: DateTime<Utc>, result: u8) -> Vec<u8> {
        format!(
            r#"{{"phenomenonTime":"{}","result":{result}}}"#,
            time.to_rfc3339()
        )
        .into_bytes()
    }

    #[test]
    fn test_process_fires_the_stream_callback() {
        let catalog = Arc::new(Catalog::new("https://tld.example.com/v1.1/").unwrap());
        catalog.register(
            serde_json::from_str(
                r#"{
                    "@iot.id": 17,
                    "name": "271_31",
                    "Datastreams": [
                        {"@iot.id": 100, "properties": {"layerName": "primary_signal"}}
                    ]
                }"#,
            )
            .unwrap(),
        );
        let called: Arc<parking_lot::Mutex<Vec<String>>> = Arc::default();
        let recorded = called.clone();
        let noop: StreamCallback = Arc::new(|_| {});
        let callbacks = Callbacks {
            primary_signal: Arc::new(move |thing| recorded.lock().push(thing)),
            signal_program: noop.clone(),
            detector_car: noop.clone(),
            detector_bike: noop,
            cycle_tick: Arc::new(|_| {}),
        };
        let dispatcher = Dispatcher::new(catalog, Arc::new(CycleRegistry::new()), callbacks);

        dispatcher.process(
            "v1.1/Datastreams(100)/Observations",
            &payload(Utc::now(), 3),
        );
        assert_eq!(*called.lock(), vec!["271_31".to_string()]);
        assert_eq!(dispatcher.stats.processed.load(Ordering::Relaxed), 1);

        // A stale observation is dropped before it reaches the callback.
        dispatcher.process(
            "v1.1/Datastreams(100)/Observations",
            &payload(Utc::now() - Duration::seconds(400), 3),
        );
        assert_eq!(called.lock().len(), 1);
        assert_eq!(dispatcher.stats.cancelled.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_process_drops_unroutable_messages() {
        let (dispatcher, _) = test_dispatcher();
        dispatcher.process("v1.1/Datastreams(999)/Observations", b"{}");
        dispatcher.process("v1.1/Datastreams(100)/Observations", b"not json");
        assert_eq!(dispatcher.stats.received.load(Ordering::Relaxed), 2);
        assert_eq!(dispatcher.stats.cancelled.load(Ordering::Relaxed), 2);
        assert_eq!(dispatcher.stats.processed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_cycle_tick_rotates_all_cycles_over_the_rastered_window() {
        let (dispatcher, ticks) = test_dispatcher();
        // Recent times, aligned to the raster so rounding stays put.
        let start = round_to_raster(Utc::now() - Duration::seconds(120));
        let end = start + Duration::seconds(60);

        dispatcher.process("v1.1/Datastreams(100)/Observations", &payload(start + Duration::seconds(10), 3));

        // The very first tick cannot rotate: there is no window start yet.
        dispatcher.process("v1.1/Datastreams(101)/Observations", &payload(start, 0));
        assert!(ticks.lock().is_empty());
        assert_eq!(dispatcher.stats.cancelled.load(Ordering::Relaxed), 1);

        // The second tick closes the window [start, end).
        dispatcher.process("v1.1/Datastreams(101)/Observations", &payload(end, 0));
        let recorded = ticks.lock();
        assert_eq!(recorded.len(), 1);
        let tick = &recorded[0];
        assert_eq!(tick.thing, "271_31");
        assert_eq!(tick.start_time, start);
        assert_eq!(tick.end_time, end);
        assert_eq!(tick.primary_signal.completed.len(), 1);
        assert_eq!(tick.primary_signal.completed[0].result, 3);
        assert!(tick.detector_car.completed.is_empty());
    }
}
