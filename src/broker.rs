// src/broker.rs
//
// Shared MQTT connection options for the two brokers.

use anyhow::{anyhow, Context, Result};
use rumqttc::MqttOptions;
use std::time::Duration;

/// Build client options for a `tcp://host:port` broker URL. Each connection
/// gets a random client id suffix so that restarts never collide with a
/// session the broker still holds.
pub fn options(
    url: &str,
    client_prefix: &str,
    credentials: Option<(&str, &str)>,
) -> Result<MqttOptions> {
    let address = url
        .strip_prefix("tcp://")
        .ok_or_else(|| anyhow!("unsupported broker url scheme: {url}"))?;
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .with_context(|| format!("invalid broker port in {url}"))?,
        ),
        None => (address.to_string(), 1883),
    };

    let client_id = format!("{client_prefix}-{}", rand::random::<u32>());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(60));
    if let Some((username, password)) = credentials {
        options.set_credentials(username, password);
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_parse_host_and_port() {
        let options = options("tcp://broker.example.com:8883", "predictor", None).unwrap();
        assert_eq!(
            options.broker_address(),
            ("broker.example.com".to_string(), 8883)
        );
    }

    #[test]
    fn test_options_default_port() {
        let options = options("tcp://broker.example.com", "predictor", None).unwrap();
        assert_eq!(
            options.broker_address(),
            ("broker.example.com".to_string(), 1883)
        );
    }

    #[test]
    fn test_options_reject_other_schemes() {
        assert!(options("ws://broker.example.com", "predictor", None).is_err());
    }
}
