use crate::error::ProxyError;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_API_VERSION: &str = "1.38";
pub const DEFAULT_MINING_IMAGE: &str = "massgrid/10.0-autominer-ubuntu16.04:latest";
pub const DEFAULT_MINER_NAME: &str = "leisureMiner";
pub const MINER_BASELINE_ENV: &str = "NVIDIA_VISIBLE_DEVICES=all";
pub const ROLE_LABEL_KEY: &str = "com.massgrid.type";
pub const ROLE_WORKER: &str = "worker";
pub const ROLE_PROXY: &str = "proxy";
pub const ROLE_LEISURE_MINER: &str = "leisureminer";

/// Where the container engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHost {
    Unix(PathBuf),
    /// Base URL without trailing slash, e.g. `http://10.0.0.2:2375`
    Tcp(String),
}

impl EngineHost {
    /// Parse a `DOCKER_HOST` style address.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::Config(format!("Invalid engine host {raw:?}: {e}")))?;

        match url.scheme() {
            "unix" => {
                if url.path().is_empty() {
                    return Err(ProxyError::Config(format!(
                        "Engine host {raw:?} has no socket path"
                    )));
                }
                Ok(EngineHost::Unix(PathBuf::from(url.path())))
            }
            "tcp" | "http" | "https" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| ProxyError::Config(format!("Engine host {raw:?} has no host")))?;
                let scheme = if url.scheme() == "https" { "https" } else { "http" };
                let port = url.port().unwrap_or(2375);
                Ok(EngineHost::Tcp(format!("{scheme}://{host}:{port}")))
            }
            other => Err(ProxyError::Config(format!(
                "Unsupported engine host scheme {other:?}"
            ))),
        }
    }
}

/// Runtime settings. Everything except engine connectivity is compiled in.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub engine_host: EngineHost,
    pub api_version: String,
    pub image: String,
    pub miner_name: String,
    pub baseline_env: String,
    pub role_label_key: String,
    pub cap_add: Vec<String>,
    /// Match role label keys by substring instead of exact key.
    pub legacy_label_matching: bool,
    pub idle_timeout: Duration,
    pub barrier_timeout: Duration,
    pub barrier_poll_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_in_flight: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            engine_host: EngineHost::Unix(PathBuf::from("/var/run/docker.sock")),
            api_version: DEFAULT_API_VERSION.to_string(),
            image: DEFAULT_MINING_IMAGE.to_string(),
            miner_name: DEFAULT_MINER_NAME.to_string(),
            baseline_env: MINER_BASELINE_ENV.to_string(),
            role_label_key: ROLE_LABEL_KEY.to_string(),
            cap_add: vec!["net_admin".to_string()],
            legacy_label_matching: false,
            idle_timeout: Duration::from_secs(3),
            barrier_timeout: Duration::from_secs(60),
            barrier_poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(3),
            max_in_flight: 8,
        }
    }
}

impl ProxySettings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, ProxyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ProxyError> {
        let mut settings = Self::default();

        let host = lookup("DOCKER_HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string());
        settings.engine_host = EngineHost::parse(host.trim())?;

        if let Some(version) = lookup("DOCKER_API_VERSION").filter(|v| !v.trim().is_empty()) {
            settings.api_version = version.trim().trim_start_matches('v').to_string();
        }

        if let Some(flag) = lookup("LEISURE_PROXY_LEGACY_LABELS") {
            settings.legacy_label_matching = matches!(flag.trim(), "1" | "true" | "yes");
        }

        Ok(settings)
    }
}

/// Coin and pool parameters handed to the miner image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerConfig {
    pub miner_type: String,
    pub miner_address: String,
    pub miner_worker: String,
    pub miner_pool1: String,
    pub miner_pool2: String,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            miner_type: "ETH".to_string(),
            miner_address: "wany".to_string(),
            miner_worker: "worker".to_string(),
            miner_pool1: "eth.f2pool.com:6688".to_string(),
            miner_pool2: "eth.f2pool.com:8008".to_string(),
        }
    }
}

impl MinerConfig {
    /// Resolve the miner configuration from engine-level `key=value` labels.
    /// Unrecognized labels are ignored; missing fields keep their defaults.
    pub fn resolve(labels: &[String]) -> Self {
        let mut config = Self::default();

        for label in labels {
            let Some((key, value)) = label.split_once('=') else {
                tracing::warn!("Skipping engine label without '=': {label}");
                continue;
            };

            let field = if key.contains("MINER_TYPE") {
                &mut config.miner_type
            } else if key.contains("MINER_ADDRESS") {
                &mut config.miner_address
            } else if key.contains("MINER_WORKER") {
                &mut config.miner_worker
            } else if key.contains("MINER_POOL1") {
                &mut config.miner_pool1
            } else if key.contains("MINER_POOL2") {
                &mut config.miner_pool2
            } else {
                continue;
            };
            *field = value.to_string();
        }

        config
    }

    /// Environment for the miner container. Order and key names are the
    /// contract with the miner image.
    pub fn env(&self, baseline: &str) -> Vec<String> {
        vec![
            baseline.to_string(),
            format!("MINER_TYPE={}", self.miner_type),
            format!("MINER_ADDRESS={}", self.miner_address),
            format!("MINER_WORKER={}", self.miner_worker),
            format!("MINER_POOL={}", self.miner_pool1),
            format!("MINER_POOL1={}", self.miner_pool2),
        ]
    }
}
