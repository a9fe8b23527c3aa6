// src/catalog.rs
//
// The SensorThings catalog: which things (signal groups) exist, which
// datastreams they publish, and which MQTT topic belongs to which stream.
// Synced once at startup; the ingest dispatcher consults the resulting
// directories for every inbound message.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::info;

use crate::observation::{Observation, StreamKind};
use crate::registry::CycleRegistry;

const ELEMENTS_PER_PAGE: usize = 100;
const PARALLEL_PAGE_REQUESTS: usize = 10;

/// The upstream service publishing the traffic light datastreams.
const SERVICE_NAME: &str = "HH_STA_traffic_lights";

/// Lane types relevant for bike routing. Everything else is ignored.
const LANE_TYPES: [&str; 5] = [
    "Radfahrer",
    "KFZ/Radfahrer",
    "Fußgänger/Radfahrer",
    "Bus/Radfahrer",
    "KFZ/Bus/Radfahrer",
];

/// A traffic light thing from the SensorThings API.
#[derive(Debug, Clone, Deserialize)]
pub struct Thing {
    #[serde(rename = "@iot.id")]
    pub iot_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: ThingProperties,
    #[serde(rename = "Datastreams", default)]
    pub datastreams: Vec<Datastream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThingProperties {
    #[serde(rename = "laneType", default)]
    pub lane_type: String,
    /// The id of the crossing this signal group belongs to.
    #[serde(rename = "trafficLightsId", default)]
    pub traffic_lights_id: String,
}

impl Thing {
    /// A directory-safe identifier used for per-thing status artifacts.
    pub fn topic(&self) -> String {
        self.name.replace('/', "_")
    }
}

/// A datastream of a thing, one per sensor stream kind.
#[derive(Debug, Clone, Deserialize)]
pub struct Datastream {
    #[serde(rename = "@iot.id")]
    pub iot_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: DatastreamProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatastreamProperties {
    #[serde(rename = "layerName", default)]
    pub layer_name: String,
}

impl Datastream {
    /// The broker topic this datastream's observations arrive on.
    pub fn mqtt_topic(&self) -> String {
        format!("v1.1/Datastreams({})/Observations", self.iot_id)
    }
}

/// Where an inbound message on a topic belongs.
#[derive(Debug, Clone)]
pub struct TopicRoute {
    pub kind: StreamKind,
    pub thing: String,
}

#[derive(Debug)]
pub struct Catalog {
    base_url: String,
    http: reqwest::Client,
    things: DashMap<String, Thing>,
    routes: DashMap<String, TopicRoute>,
}

#[derive(Debug, Deserialize)]
struct ThingsPage {
    #[serde(default)]
    value: Vec<Thing>,
    #[serde(rename = "@iot.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatastreamsPage {
    #[serde(default)]
    value: Vec<ExpandedDatastream>,
    #[serde(rename = "@iot.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpandedDatastream {
    #[serde(default)]
    properties: DatastreamProperties,
    #[serde(rename = "Thing")]
    thing: ExpandedThing,
    #[serde(rename = "Observations", default)]
    observations: Vec<Observation>,
}

#[derive(Debug, Deserialize)]
struct ExpandedThing {
    name: String,
}

fn lane_type_filter(prefix: &str) -> String {
    LANE_TYPES
        .iter()
        .map(|lane_type| format!("{prefix}properties/laneType eq '{lane_type}'"))
        .collect::<Vec<_>>()
        .join(" or ")
}

impl Catalog {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("could not build the catalog http client")?;
        Ok(Catalog {
            base_url: base_url.to_string(),
            http,
            things: DashMap::new(),
            routes: DashMap::new(),
        })
    }

    /// Fetch all things with their datastreams and fill the directories.
    /// A failure here is fatal: without the topic tables no observation can
    /// be routed.
    pub async fn sync(self: &Arc<Self>) -> Result<()> {
        info!("Syncing things from {} ...", self.base_url);
        let filter = format!(
            "Datastreams/properties/serviceName eq '{SERVICE_NAME}' and ({})",
            lane_type_filter("")
        );
        let mut page = 0;
        loop {
            // A wave of parallel page requests to speed things up.
            let mut wave = JoinSet::new();
            for _ in 0..PARALLEL_PAGE_REQUESTS {
                let catalog = self.clone();
                let filter = filter.clone();
                wave.spawn(async move { catalog.fetch_things_page(&filter, page).await });
                page += 1;
            }
            info!(
                "Bulk syncing things from pages {}-{}...",
                page - PARALLEL_PAGE_REQUESTS,
                page - 1
            );
            let mut more = false;
            while let Some(result) = wave.join_next().await {
                more |= result.context("things page task failed")??;
            }
            if !more {
                break;
            }
        }
        info!("Synced {} things.", self.things.len());
        Ok(())
    }

    async fn fetch_things_page(&self, filter: &str, page: usize) -> Result<bool> {
        let skip = (page * ELEMENTS_PER_PAGE).to_string();
        let response = self
            .http
            .get(format!("{}Things", self.base_url))
            .query(&[
                ("$filter", filter),
                ("$expand", "Datastreams"),
                ("$skip", skip.as_str()),
            ])
            .send()
            .await
            .context("could not fetch things")?
            .error_for_status()
            .context("things request was rejected")?;
        let page: ThingsPage = response.json().await.context("could not decode things")?;
        for thing in page.value {
            self.register(thing);
        }
        Ok(page.next_link.is_some())
    }

    pub(crate) fn register(&self, thing: Thing) {
        for datastream in &thing.datastreams {
            let Some(kind) = StreamKind::from_layer_name(&datastream.properties.layer_name)
            else {
                continue;
            };
            self.routes.insert(
                datastream.mqtt_topic(),
                TopicRoute {
                    kind,
                    thing: thing.name.clone(),
                },
            );
        }
        self.things.insert(thing.name.clone(), thing);
    }

    /// Seed the signal program cycles with the most recent observation per
    /// thing, so that program-specific histories can be selected before the
    /// first live program observation arrives.
    pub async fn prefetch_programs(self: &Arc<Self>, registry: &Arc<CycleRegistry>) -> Result<()> {
        info!("Prefetching most recent program observations...");
        let filter = format!(
            "properties/serviceName eq '{SERVICE_NAME}' \
             and (properties/layerName eq 'signal_program') and ({})",
            lane_type_filter("Thing/")
        );
        let mut page = 0;
        loop {
            let mut wave = JoinSet::new();
            for _ in 0..PARALLEL_PAGE_REQUESTS {
                let catalog = self.clone();
                let registry = registry.clone();
                let filter = filter.clone();
                wave.spawn(async move {
                    catalog.fetch_programs_page(&filter, page, &registry).await
                });
                page += 1;
            }
            info!(
                "Bulk prefetching observations from pages {}-{}...",
                page - PARALLEL_PAGE_REQUESTS,
                page - 1
            );
            let mut more = false;
            while let Some(result) = wave.join_next().await {
                more |= result.context("observations page task failed")??;
            }
            if !more {
                break;
            }
        }
        info!("Prefetched most recent program observations.");
        Ok(())
    }

    async fn fetch_programs_page(
        &self,
        filter: &str,
        page: usize,
        registry: &CycleRegistry,
    ) -> Result<bool> {
        let skip = (page * ELEMENTS_PER_PAGE).to_string();
        let response = self
            .http
            .get(format!("{}Datastreams", self.base_url))
            .query(&[
                ("$filter", filter),
                ("$expand", "Thing,Observations($orderby=phenomenonTime;$top=1)"),
                ("$skip", skip.as_str()),
            ])
            .send()
            .await
            .context("could not fetch observations")?
            .error_for_status()
            .context("observations request was rejected")?;
        let page: DatastreamsPage = response
            .json()
            .await
            .context("could not decode observations")?;
        for datastream in page.value {
            if datastream.properties.layer_name != StreamKind::SignalProgram.layer_name() {
                continue;
            }
            let Some(observation) = datastream.observations.first() else {
                continue;
            };
            registry
                .get_or_create(StreamKind::SignalProgram, &datastream.thing.name)
                .add(*observation);
        }
        Ok(page.next_link.is_some())
    }

    pub fn route(&self, topic: &str) -> Option<TopicRoute> {
        self.routes.get(topic).map(|route| route.clone())
    }

    /// All broker topics the ingest listener must subscribe to.
    pub fn topics(&self) -> Vec<String> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn thing_names(&self) -> Vec<String> {
        self.things.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn thing_count(&self) -> usize {
        self.things.len()
    }

    pub fn for_each_thing(&self, mut visit: impl FnMut(&Thing)) {
        for entry in self.things.iter() {
            visit(entry.value());
        }
    }
}
