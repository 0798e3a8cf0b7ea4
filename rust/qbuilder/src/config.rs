use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub default_page_size: i64,
    pub max_page_size: i64,
    /// Relative preset used when a payload request carries neither
    /// `start`/`end` nor `globalSelectedInterval`.
    pub default_time_range: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    qbuilder_listen_addr: Option<String>,
    #[serde(default)]
    qbuilder_listen_host: Option<String>,
    #[serde(default)]
    qbuilder_listen_port: Option<u16>,
    #[serde(default)]
    qbuilder_api_key: Option<String>,
    #[serde(default = "default_page_size")]
    qbuilder_default_page_size: i64,
    #[serde(default = "default_max_page_size")]
    qbuilder_max_page_size: i64,
    #[serde(default)]
    qbuilder_default_time_range: Option<String>,
    #[serde(default = "default_timeout_secs")]
    qbuilder_request_timeout_secs: u64,
}

const DEFAULT_TIME_RANGE: &str = "15m";

const fn default_page_size() -> i64 {
    100
}

const fn default_max_page_size() -> i64 {
    1000
}

const fn default_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse QBUILDER_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.qbuilder_listen_addr,
            raw.qbuilder_listen_host,
            raw.qbuilder_listen_port,
        )?;

        let default_time_range = raw
            .qbuilder_default_time_range
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_TIME_RANGE.to_string());
        validate_time_range(&default_time_range)?;

        let api_key = raw.qbuilder_api_key.filter(|key| !key.trim().is_empty());

        Ok(Self {
            listen_addr,
            api_key,
            default_page_size: raw.qbuilder_default_page_size.max(1),
            max_page_size: raw
                .qbuilder_max_page_size
                .max(raw.qbuilder_default_page_size),
            default_time_range,
            request_timeout: Duration::from_secs(raw.qbuilder_request_timeout_secs.max(1)),
        })
    }

    /// In-process configuration for tests and embedding callers.
    pub fn embedded(api_key: Option<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_key,
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            default_time_range: DEFAULT_TIME_RANGE.to_string(),
            request_timeout: Duration::from_secs(default_timeout_secs()),
        }
    }

    /// Clamps a requested page size into `1..=max_page_size`.
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        requested
            .filter(|size| *size > 0)
            .unwrap_or(self.default_page_size)
            .min(self.max_page_size)
    }
}

/// The preset must parse and resolve against the current clock.
fn validate_time_range(preset: &str) -> Result<()> {
    crate::time::parse_time_value(preset)
        .and_then(|spec| spec.resolve(chrono::Utc::now()))
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!("invalid QBUILDER_DEFAULT_TIME_RANGE: {err}"))
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid QBUILDER_LISTEN_ADDR value")?
            .next()
            .context("QBUILDER_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid qbuilder listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
