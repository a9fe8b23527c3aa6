// src/config.rs
//
// Service configuration from the environment. Every required key is
// validated at startup; a missing or malformed value aborts the process.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for all disk artifacts (histories, predictions, status).
    pub static_path: PathBuf,
    /// Base URL of the SensorThings API, e.g. `https://example.com/v1.1/`.
    pub sensorthings_url: String,
    /// Broker publishing the raw sensor observations.
    pub sensorthings_mqtt_url: String,
    /// Broker the predictions are published to.
    pub prediction_mqtt_url: String,
    pub prediction_mqtt_username: Option<String>,
    pub prediction_mqtt_password: Option<String>,
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("environment variable {name} not set"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let static_path = required("STATIC_PATH")?;
        if static_path.ends_with('/') {
            bail!("STATIC_PATH must not end with a slash: {static_path}");
        }

        let sensorthings_url = required("SENSORTHINGS_URL")?;
        if !sensorthings_url.ends_with("/v1.1/") {
            bail!("SENSORTHINGS_URL must end with /v1.1/: {sensorthings_url}");
        }

        let sensorthings_mqtt_url = required("SENSORTHINGS_MQTT_URL")?;
        if !sensorthings_mqtt_url.starts_with("tcp://") {
            bail!("SENSORTHINGS_MQTT_URL must start with tcp://: {sensorthings_mqtt_url}");
        }

        let prediction_mqtt_url = required("PREDICTION_MQTT_URL")?;
        if !prediction_mqtt_url.starts_with("tcp://") {
            bail!("PREDICTION_MQTT_URL must start with tcp://: {prediction_mqtt_url}");
        }

        Ok(Config {
            static_path: PathBuf::from(static_path),
            sensorthings_url,
            sensorthings_mqtt_url,
            prediction_mqtt_url,
            prediction_mqtt_username: env::var("PREDICTION_MQTT_USERNAME").ok(),
            prediction_mqtt_password: env::var("PREDICTION_MQTT_PASSWORD").ok(),
        })
    }
}
