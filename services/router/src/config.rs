//! Router configuration (env-driven).

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// A backend server entry from `SQLMUX_SERVERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub address: SocketAddr,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of routing workers.
    pub threads: usize,

    /// Client listen addresses.
    pub listen: Vec<SocketAddr>,

    /// Backend servers, in routing order.
    pub servers: Vec<ServerConfig>,

    /// Per-server pool capacity; 0 disables pooling.
    pub persist_pool_max: usize,

    /// Maximum age of a pooled connection.
    pub persist_max_time: Duration,

    /// Close clients idle for this long.
    pub idle_timeout: Option<Duration>,

    /// Close clients whose writes have been stuck for this long.
    pub write_timeout: Option<Duration>,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// How often aggregated statistics are logged.
    pub stats_interval: Duration,

    /// How often the watchdog runs, if at all.
    pub watchdog_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let threads = match lookup("SQLMUX_THREADS") {
            Some(v) => v
                .parse::<usize>()
                .context("SQLMUX_THREADS must be a positive integer.")?,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        if threads == 0 {
            bail!("SQLMUX_THREADS must be at least 1.");
        }

        let listen = parse_listen(
            &lookup("SQLMUX_LISTEN").unwrap_or_else(|| "127.0.0.1:4006".to_string()),
        )?;

        let servers = parse_servers(
            &lookup("SQLMUX_SERVERS")
                .context("Missing backend servers. Set SQLMUX_SERVERS to name=host:port[,...].")?,
        )?;

        let persist_pool_max: usize = lookup("SQLMUX_PERSIST_POOL_MAX")
            .map(|v| v.parse())
            .transpose()
            .context("SQLMUX_PERSIST_POOL_MAX must be an integer.")?
            .unwrap_or(0);

        let persist_max_time = Duration::from_secs(
            lookup("SQLMUX_PERSIST_MAX_TIME_SECS")
                .map(|v| v.parse())
                .transpose()
                .context("SQLMUX_PERSIST_MAX_TIME_SECS must be an integer (seconds).")?
                .unwrap_or(3600),
        );

        let idle_timeout = optional_secs(
            lookup("SQLMUX_CONN_IDLE_TIMEOUT_SECS"),
            "SQLMUX_CONN_IDLE_TIMEOUT_SECS must be an integer (seconds).",
        )?;

        let write_timeout = optional_secs(
            lookup("SQLMUX_NET_WRITE_TIMEOUT_SECS"),
            "SQLMUX_NET_WRITE_TIMEOUT_SECS must be an integer (seconds).",
        )?;

        let connect_timeout_ms: u64 = lookup("SQLMUX_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("SQLMUX_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let stats_interval_secs: u64 = lookup("SQLMUX_STATS_INTERVAL_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("SQLMUX_STATS_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(60);
        let stats_interval = Duration::from_secs(stats_interval_secs.max(1));

        let watchdog_interval = optional_secs(
            Some(lookup("SQLMUX_WATCHDOG_INTERVAL_SECS").unwrap_or_else(|| "30".to_string())),
            "SQLMUX_WATCHDOG_INTERVAL_SECS must be an integer (seconds).",
        )?;

        let log_level = lookup("SQLMUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            threads,
            listen,
            servers,
            persist_pool_max,
            persist_max_time,
            idle_timeout,
            write_timeout,
            connect_timeout,
            stats_interval,
            watchdog_interval,
            log_level,
        })
    }
}

/// Seconds, where 0 means off.
fn optional_secs(value: Option<String>, message: &'static str) -> Result<Option<Duration>> {
    let secs: u64 = value
        .map(|v| v.parse())
        .transpose()
        .context(message)?
        .unwrap_or(0);
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

/// Parse a comma separated list of socket addresses.
pub fn parse_listen(value: &str) -> Result<Vec<SocketAddr>> {
    let listen = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<SocketAddr>()
                .with_context(|| format!("Invalid listen address: {s}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if listen.is_empty() {
        bail!("SQLMUX_LISTEN must name at least one address.");
    }
    Ok(listen)
}

/// Parse `name=host:port[,name=host:port...]`. Host names are resolved now.
pub fn parse_servers(value: &str) -> Result<Vec<ServerConfig>> {
    let mut servers: Vec<ServerConfig> = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, target)) = entry.split_once('=') else {
            bail!("Invalid server entry {entry:?}: expected name=host:port.");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid server entry {entry:?}: empty name.");
        }
        if servers.iter().any(|s| s.name == name) {
            bail!("Duplicate server name {name:?}.");
        }

        let address = target
            .trim()
            .to_socket_addrs()
            .with_context(|| format!("Could not resolve server {name} at {target}"))?
            .next()
            .with_context(|| format!("Server {name} at {target} resolved to no addresses"))?;

        servers.push(ServerConfig {
            name: name.to_string(),
            address,
        });
    }

    if servers.is_empty() {
        bail!("SQLMUX_SERVERS must name at least one server.");
    }
    Ok(servers)
}
