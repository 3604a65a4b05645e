//! Broker configuration loading.
//!
//! TOML is the sole config source.  Every knob has a default, so the
//! minimal config is an empty file (one default virtual host, standard
//! STOMP port).
//!
//! # Knobs
//! - `bind`: listen address, default `0.0.0.0:61613`
//! - `die_delay_ms`: grace between an ERROR frame and the close, default 5000
//! - `outbound_heartbeat_ms`: server's minimum send interval, default 100
//! - `inbound_heartbeat_ms`: server's minimum expected receive interval,
//!   default 10000
//! - `producer_route_cache_size`: default 10
//! - `[[virtual_hosts]]`: `id`, `default_host`, optional `[users]` table
//!   (login = passcode; presence enables authentication), `store`
//!   (default true), `destination_buffer`, `read_buffer_bytes`

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind: String,
    pub die_delay_ms: u64,
    pub outbound_heartbeat_ms: u64,
    pub inbound_heartbeat_ms: u64,
    pub producer_route_cache_size: usize,
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

#[derive(Debug, Clone)]
pub struct VirtualHostConfig {
    pub id: String,
    pub default_host: bool,
    /// login -> passcode; an empty table disables authentication.
    pub users: HashMap<String, String>,
    /// Attach the in-memory store (enables transactional units of work).
    pub store: bool,
    /// Bound of destination intakes and queue buffers.
    pub destination_buffer: usize,
    /// When set, connections read through a pooled buffer of this size.
    pub read_buffer_bytes: Option<usize>,
}

impl Default for VirtualHostConfig {
    fn default() -> Self {
        VirtualHostConfig {
            id: "default".to_owned(),
            default_host: false,
            users: HashMap::new(),
            store: true,
            destination_buffer: 1024,
            read_buffer_bytes: None,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            bind: "0.0.0.0:61613".to_owned(),
            die_delay_ms: 5_000,
            outbound_heartbeat_ms: 100,
            inbound_heartbeat_ms: 10_000,
            producer_route_cache_size: 10,
            virtual_hosts: vec![VirtualHostConfig {
                default_host: true,
                ..VirtualHostConfig::default()
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    bind: Option<String>,
    die_delay_ms: Option<u64>,
    outbound_heartbeat_ms: Option<u64>,
    inbound_heartbeat_ms: Option<u64>,
    producer_route_cache_size: Option<usize>,
    virtual_hosts: Option<Vec<RawVirtualHost>>,
}

#[derive(Debug, Deserialize)]
struct RawVirtualHost {
    id: Option<String>,
    default_host: Option<bool>,
    users: Option<HashMap<String, String>>,
    store: Option<bool>,
    destination_buffer: Option<usize>,
    read_buffer_bytes: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<BrokerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = BrokerConfig::default();

    let virtual_hosts = match raw.virtual_hosts {
        None => defaults.virtual_hosts,
        Some(raws) => {
            if raws.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "at least one [[virtual_hosts]] entry is required".to_owned(),
                ));
            }
            let mut hosts = Vec::with_capacity(raws.len());
            for (i, r) in raws.into_iter().enumerate() {
                let id = r
                    .id
                    .ok_or_else(|| ConfigError::MissingField(format!("virtual_hosts[{}].id", i)))?;
                hosts.push(VirtualHostConfig {
                    id,
                    default_host: r.default_host.unwrap_or(false),
                    users: r.users.unwrap_or_default(),
                    store: r.store.unwrap_or(true),
                    destination_buffer: r.destination_buffer.unwrap_or(1024),
                    read_buffer_bytes: r.read_buffer_bytes,
                });
            }
            // A single host is the default implicitly; several need exactly
            // one marked.
            match hosts.iter().filter(|h| h.default_host).count() {
                0 if hosts.len() == 1 => hosts[0].default_host = true,
                1 => {}
                0 => {
                    return Err(ConfigError::InvalidValue(
                        "one virtual host must set default_host = true".to_owned(),
                    ));
                }
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "only one virtual host may set default_host = true".to_owned(),
                    ));
                }
            }
            let mut seen = std::collections::HashSet::new();
            for h in &hosts {
                if !seen.insert(h.id.clone()) {
                    return Err(ConfigError::InvalidValue(format!(
                        "duplicate virtual host id '{}'",
                        h.id
                    )));
                }
            }
            hosts
        }
    };

    Ok(BrokerConfig {
        bind: raw.bind.unwrap_or(defaults.bind),
        die_delay_ms: raw.die_delay_ms.unwrap_or(defaults.die_delay_ms),
        outbound_heartbeat_ms: raw
            .outbound_heartbeat_ms
            .unwrap_or(defaults.outbound_heartbeat_ms),
        inbound_heartbeat_ms: raw
            .inbound_heartbeat_ms
            .unwrap_or(defaults.inbound_heartbeat_ms),
        producer_route_cache_size: raw
            .producer_route_cache_size
            .unwrap_or(defaults.producer_route_cache_size),
        virtual_hosts,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
