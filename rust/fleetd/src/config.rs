use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub api_key: Option<String>,
    /// Admin account created at start-up when it does not exist yet.
    pub bootstrap_admin: Option<String>,
    /// Environments nodes may enroll into and permissions are generated for.
    pub environments: Vec<String>,
    /// Nodes not seen within this many hours count as inactive.
    pub inactive_hours: i64,
    pub request_timeout: Duration,
    pub apply_schema: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    fleetd_listen_addr: Option<String>,
    #[serde(default)]
    fleetd_listen_host: Option<String>,
    #[serde(default)]
    fleetd_listen_port: Option<u16>,
    #[serde(default)]
    fleetd_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    fleetd_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    fleetd_api_key: Option<String>,
    #[serde(default)]
    fleetd_bootstrap_admin: Option<String>,
    #[serde(default)]
    fleetd_environments: Option<String>,
    #[serde(default = "default_inactive_hours")]
    fleetd_inactive_hours: i64,
    #[serde(default = "default_timeout_secs")]
    fleetd_request_timeout_secs: u64,
    #[serde(default = "default_apply_schema")]
    fleetd_apply_schema: bool,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_inactive_hours() -> i64 {
    72
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_apply_schema() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse FLEETD_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.fleetd_listen_addr,
            raw.fleetd_listen_host,
            raw.fleetd_listen_port,
        )?;

        let database_url = raw
            .fleetd_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("FLEETD_DATABASE_URL or DATABASE_URL must be set")?;

        let environments = raw
            .fleetd_environments
            .map(|csv| parse_csv(&csv))
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.fleetd_max_pool_size.max(1),
            pg_ssl_root_cert: non_empty(raw.pgsslrootcert),
            pg_ssl_cert: non_empty(raw.pgsslcert),
            pg_ssl_key: non_empty(raw.pgsslkey),
            api_key: non_empty(raw.fleetd_api_key),
            bootstrap_admin: non_empty(raw.fleetd_bootstrap_admin),
            environments,
            inactive_hours: raw.fleetd_inactive_hours.max(1),
            request_timeout: Duration::from_secs(raw.fleetd_request_timeout_secs.max(1)),
            apply_schema: raw.fleetd_apply_schema,
        })
    }

    /// Configuration for an in-process engine with no database behind it.
    pub fn embedded(environments: Vec<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url: String::new(),
            max_pool_size: 1,
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            api_key: None,
            bootstrap_admin: None,
            environments,
            inactive_hours: default_inactive_hours(),
            request_timeout: Duration::from_secs(default_timeout_secs()),
            apply_schema: false,
        }
    }

    pub fn has_environment(&self, name: &str) -> bool {
        self.environments.iter().any(|env| env == name)
    }
}

fn parse_csv(csv: &str) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();
    for part in csv.split(',') {
        let entry = part.trim();
        if !entry.is_empty() && !entries.iter().any(|existing| existing == entry) {
            entries.push(entry.to_string());
        }
    }
    entries
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid FLEETD_LISTEN_ADDR value")?
            .next()
            .context("FLEETD_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid fleetd listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
