//! Typed configuration surface consumed by the core.
//!
//! Loading/validating these values from a file, environment, or CLI flags is
//! an external collaborator's job; this module only defines the shapes and
//! their documented defaults.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub redirect_ports: Vec<u16>,
    pub mitm: MitmConfig,
    pub dns: DnsConfig,
    pub upstream: UpstreamConfig,
    pub event_ring_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9890".to_string(),
            redirect_ports: vec![80, 443, 22],
            mitm: MitmConfig::default(),
            dns: DnsConfig::default(),
            upstream: UpstreamConfig::default(),
            event_ring_size: 10,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct MitmConfig {
    pub enabled: bool,
    pub whitelist: Vec<String>,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub ca_validity: Duration,
    pub site_cert_validity: Duration,
    pub leaf_refresh_margin: Duration,
    pub max_body_size: usize,
    pub persist_leaves: bool,
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            whitelist: Vec::new(),
            ca_cert_path: PathBuf::from("ca.crt"),
            ca_key_path: PathBuf::from("ca.key"),
            ca_validity: Duration::from_secs(365 * 24 * 3600),
            site_cert_validity: Duration::from_secs(7 * 24 * 3600),
            leaf_refresh_margin: Duration::from_secs(3600),
            max_body_size: 64 * 1024,
            persist_leaves: true,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct DnsConfig {
    pub listen_addr: String,
    pub domestic_servers: Vec<String>,
    pub foreign_servers: Vec<String>,
    pub tcp_for_foreign: bool,
    pub upstream_timeout: Duration,
    pub max_concurrent_splits: usize,
    pub cache_capacity: usize,
    pub min_ttl: u32,
    pub max_ttl: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6363".to_string(),
            domestic_servers: vec!["114.114.114.114:53".to_string()],
            foreign_servers: vec!["8.8.8.8:53".to_string()],
            tcp_for_foreign: false,
            upstream_timeout: Duration::from_secs(5),
            max_concurrent_splits: 10,
            cache_capacity: 10_000,
            min_ttl: 1,
            max_ttl: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub enum UpstreamKind {
    Disabled,
    Socks5,
    HttpConnect,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub kind: UpstreamKind,
    pub addr: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: UpstreamKind::Disabled,
            addr: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}
