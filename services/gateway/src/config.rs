use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

// Gateway service configuration sourced from environment variables, with an
// optional YAML file for overrides (the route dictionary is YAML-only).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // TCP listener bind address for client connections.
    pub listen_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Heartbeat period; idle timeout is twice this.
    pub heartbeat_secs: u64,
    // Capacity of the send queue; the order queue gets ten times this.
    pub messages_buffer_size: usize,
    // Deflate handshake/message payloads when it makes them smaller.
    pub data_compression: bool,
    // Max packet body accepted from or produced for a client.
    pub max_packet_bytes: usize,
    // Routes assigned two-byte dictionary codes in the handshake.
    pub route_dictionary: Vec<String>,
}

const DEFAULT_GATEWAY_CONFIG_PATH: &str = "/usr/local/rally/config.yml";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_MESSAGES_BUFFER_SIZE: usize = 100;
const DEFAULT_MAX_PACKET_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    listen_bind: Option<String>,
    metrics_bind: Option<String>,
    heartbeat_secs: Option<u64>,
    messages_buffer_size: Option<usize>,
    data_compression: Option<bool>,
    max_packet_bytes: Option<usize>,
    route_dictionary: Option<Vec<String>>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let listen_bind = std::env::var("RALLY_LISTEN_BIND")
            .unwrap_or_else(|_| "0.0.0.0:3250".to_string())
            .parse()
            .with_context(|| "parse RALLY_LISTEN_BIND")?;
        let metrics_bind = std::env::var("RALLY_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse RALLY_METRICS_BIND")?;
        let heartbeat_secs = std::env::var("RALLY_HEARTBEAT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);
        let messages_buffer_size = std::env::var("RALLY_MESSAGES_BUFFER_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MESSAGES_BUFFER_SIZE);
        let data_compression = std::env::var("RALLY_DATA_COMPRESSION")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let max_packet_bytes = std::env::var("RALLY_MAX_PACKET_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_PACKET_BYTES);
        Ok(Self {
            listen_bind,
            metrics_bind,
            heartbeat_secs,
            messages_buffer_size,
            data_compression,
            max_packet_bytes,
            route_dictionary: Vec::new(),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("RALLY_GATEWAY_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_GATEWAY_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // Only an explicitly requested file is required to exist.
                if override_path.is_some() {
                    return Err(err)
                        .with_context(|| format!("read RALLY_GATEWAY_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read gateway config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            if let Some(value) = override_cfg.listen_bind {
                config.listen_bind = value.parse().with_context(|| "parse listen_bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.heartbeat_secs {
                if value > 0 {
                    config.heartbeat_secs = value;
                }
            }
            if let Some(value) = override_cfg.messages_buffer_size {
                if value > 0 {
                    config.messages_buffer_size = value;
                }
            }
            if let Some(value) = override_cfg.data_compression {
                config.data_compression = value;
            }
            if let Some(value) = override_cfg.max_packet_bytes {
                if value > 0 {
                    config.max_packet_bytes = value;
                }
            }
            if let Some(value) = override_cfg.route_dictionary {
                config.route_dictionary = value;
            }
        }
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}
