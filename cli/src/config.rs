//! Daemon configuration: YAML file, then flags and `CHAINFEED_*` variables.

use anyhow::{Context, Result};
use chainfeed_broadcast::BroadcastConfig;
use chainfeed_core::ListenerConfig;
use chainfeed_rpc::WsClientConfig;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::logging::LogConfig;

fn default_rpc_url() -> String {
    "ws://127.0.0.1:8546".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainfeedConfig {
    /// WebSocket JSON-RPC endpoint of the upstream node.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Address the HTTP and WebSocket gateway binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub rpc: WsClientConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for ChainfeedConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            listen: default_listen(),
            rpc: WsClientConfig::default(),
            listener: ListenerConfig::default(),
            broadcast: BroadcastConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Command-line overrides. Each one also reads a `CHAINFEED_*` variable.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Upstream node WebSocket URL
    #[arg(long, env = "CHAINFEED_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Gateway bind address, e.g. 0.0.0.0:8080
    #[arg(long, env = "CHAINFEED_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Global log level
    #[arg(long, env = "CHAINFEED_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, env = "CHAINFEED_LOG_JSON")]
    pub log_json: bool,

    /// Threshold of the default high-value filter in ether, or "off"
    #[arg(long, env = "CHAINFEED_HIGH_VALUE")]
    pub high_value: Option<String>,
}

impl ChainfeedConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read `path` if given, otherwise start from the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn apply(mut self, overrides: &Overrides) -> Result<Self> {
        if let Some(url) = &overrides.rpc_url {
            self.rpc_url = url.clone();
        }
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(level) = &overrides.log_level {
            self.log.level = level.clone();
        }
        if overrides.log_json {
            self.log.json = true;
        }
        if let Some(raw) = &overrides.high_value {
            self.broadcast.high_value_threshold = match raw.trim() {
                "off" | "none" => None,
                ether => Some(
                    chainfeed_server::parse_ether(ether)
                        .map_err(anyhow::Error::msg)
                        .context("invalid --high-value")?,
                ),
            };
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use std::time::Duration;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ChainfeedConfig::from_yaml("").unwrap();
        assert_eq!(config.rpc_url, "ws://127.0.0.1:8546");
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.listener.handler_queue_capacity, 1024);
        assert_eq!(config.broadcast.connection.queue_capacity, 256);
        assert_eq!(
            config.broadcast.high_value_threshold,
            Some(U256::from(10u64).pow(U256::from(18u64)))
        );
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r#"
rpc_url: wss://node.example:8546
rpc:
  request_timeout: 5000
broadcast:
  probe_interval_secs: 10
  connection:
    queue_capacity: 64
log:
  level: debug
  components:
    chainfeed-rpc: trace
"#;
        let config = ChainfeedConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rpc_url, "wss://node.example:8546");
        assert_eq!(config.rpc.request_timeout, Duration::from_secs(5));
        assert_eq!(config.rpc.reconnect_initial, Duration::from_millis(500));
        assert_eq!(config.broadcast.probe_interval_secs, 10);
        assert_eq!(config.broadcast.connection.queue_capacity, 64);
        assert_eq!(config.broadcast.connection.ping_interval_secs, 45);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.components["chainfeed-rpc"], "trace");
    }

    #[test]
    fn overrides_win() {
        let overrides = Overrides {
            rpc_url: Some("ws://other:1".into()),
            listen: Some("127.0.0.1:9000".parse().unwrap()),
            log_level: Some("warn".into()),
            log_json: true,
            high_value: Some("0.5".into()),
        };
        let config = ChainfeedConfig::default().apply(&overrides).unwrap();
        assert_eq!(config.rpc_url, "ws://other:1");
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.log.level, "warn");
        assert!(config.log.json);
        assert_eq!(
            config.broadcast.high_value_threshold,
            Some(U256::from(5u64) * U256::from(10u64).pow(U256::from(17u64)))
        );

        let off = Overrides {
            high_value: Some("off".into()),
            ..Default::default()
        };
        let config = ChainfeedConfig::default().apply(&off).unwrap();
        assert_eq!(config.broadcast.high_value_threshold, None);

        let bad = Overrides {
            high_value: Some("much".into()),
            ..Default::default()
        };
        assert!(ChainfeedConfig::default().apply(&bad).is_err());
    }
}
