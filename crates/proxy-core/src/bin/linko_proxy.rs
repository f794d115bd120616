//! Reference binary wiring the core components together: a transparent TCP
//! listener (C4, delegating to C3 for MITM flows) and a UDP DNS listener (C5)
//! running side by side, sharing one traffic stats worker and one admin
//! query surface.
//!
//! Configuration loading, CLI parsing, and the admin HTTP server itself are
//! external collaborators this binary does not implement; it starts from
//! `ProxyConfig::default()` and exposes the same `AdminApi` those
//! collaborators would call into, so this is a runnable skeleton rather than
//! the full product surface.

use linko_proxy_core::admin::AdminApi;
use linko_proxy_core::ca::{CertificateAuthority, RootCa};
use linko_proxy_core::config::{ProxyConfig, UpstreamKind};
use linko_proxy_core::dispatcher::Dispatcher;
use linko_proxy_core::dns::{DnsCache, DnsServer, DnsSplitter, DnsStats};
use linko_proxy_core::events::EventBus;
use linko_proxy_core::geo::{GeoClassifier, StaticGeoClassifier};
use linko_proxy_core::mitm::MitmEngine;
use linko_proxy_core::platform;
use linko_proxy_core::shutdown::{join_with_grace_period, Shutdown};
use linko_proxy_core::stats::{self, StatsRegistry};
use linko_proxy_core::upstream::UpstreamClient;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    // Loading/validating this from a file, env, or CLI flags belongs to an
    // external collaborator; this binary runs with defaults.
    let config = ProxyConfig::default();
    let (shutdown, shutdown_signal) = Shutdown::new();

    let upstream = build_upstream_client(&config)?;
    let geo: Arc<dyn GeoClassifier> = Arc::new(StaticGeoClassifier::new(Vec::new()));
    let events = Arc::new(EventBus::new(config.event_ring_size));
    let traffic = StatsRegistry::new();
    let traffic_tx = stats::spawn_worker(traffic.clone(), 10_000);

    let mitm_engine = if config.mitm.enabled {
        let root = RootCa::ensure(
            &config.mitm.ca_cert_path,
            &config.mitm.ca_key_path,
            config.mitm.ca_validity,
        )?;
        let persist_dir = config.mitm.persist_leaves.then(|| {
            config
                .mitm
                .ca_cert_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default()
        });
        let ca = Arc::new(CertificateAuthority::new(
            root,
            config.mitm.site_cert_validity,
            config.mitm.leaf_refresh_margin,
            persist_dir,
        ));
        info!(fingerprint = %hex::encode(ca.ca_fingerprint_sha256()), "root CA ready");
        Some(Arc::new(MitmEngine::new(
            ca,
            upstream.clone(),
            events.clone(),
            config.mitm.max_body_size,
            config.upstream.connect_timeout,
        )?))
    } else {
        None
    };

    let dns_stats = Arc::new(DnsStats::default());
    let dns_cache = Arc::new(DnsCache::new(config.dns.cache_capacity));
    let admin = Arc::new(AdminApi::new(dns_stats.clone(), dns_cache.clone(), traffic.clone(), events.clone()));
    // `admin` is what an external HTTP server would hold onto and query;
    // this binary doesn't serve it anywhere, just keeps it alive.
    let _ = admin;

    {
        let domestic_servers = parse_server_list(&config.dns.domestic_servers);
        let foreign_servers = parse_server_list(&config.dns.foreign_servers);
        let splitter = Arc::new(DnsSplitter::new(
            domestic_servers,
            foreign_servers,
            config.dns.tcp_for_foreign,
            geo.clone(),
            upstream.clone(),
            dns_stats.clone(),
            std::time::Duration::from_secs(config.dns.min_ttl as u64),
            std::time::Duration::from_secs(config.dns.max_ttl as u64),
        ));
        let server = Arc::new(DnsServer::new(dns_cache.clone(), splitter, config.dns.max_concurrent_splits));
        let listen_addr: SocketAddr = config.dns.listen_addr.parse()?;
        let dns_shutdown = shutdown_signal.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(listen_addr, dns_shutdown).await {
                error!(error = %e, "DNS splitter exited");
            }
        });
    }

    let dispatcher = Arc::new(Dispatcher::new(
        platform::default_capability(),
        mitm_engine,
        config.mitm.whitelist.clone(),
        upstream,
        matches!(config.upstream.kind, UpstreamKind::Socks5 | UpstreamKind::HttpConnect),
        geo,
        traffic_tx,
    ));

    let listen_addr: SocketAddr = config.listen_addr.parse()?;
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "transparent proxy listening");

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received; draining in-flight connections");
                shutdown.trigger();
            }
        }
    });

    let mut accept_shutdown = shutdown_signal;
    let next_connection_id = Arc::new(AtomicU64::new(1));
    let mut connection_tasks = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = accept_shutdown.recv() => break,
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let dispatcher = dispatcher.clone();
                let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
                connection_tasks.spawn(async move {
                    if let Err(e) = dispatcher.handle_connection(conn, connection_id).await {
                        warn!(connection_id, peer = %peer, error = %e, "connection ended with an error");
                    }
                });
            }
        }
    }

    join_with_grace_period(connection_tasks).await;
    info!("shutdown complete");
    Ok(())
}

fn build_upstream_client(config: &ProxyConfig) -> anyhow::Result<UpstreamClient> {
    Ok(match config.upstream.kind {
        UpstreamKind::Disabled => UpstreamClient::Disabled,
        UpstreamKind::Socks5 => UpstreamClient::Socks5 {
            addr: config
                .upstream
                .addr
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("upstream.addr required when upstream.kind = Socks5"))?
                .parse()?,
        },
        UpstreamKind::HttpConnect => UpstreamClient::HttpConnect {
            addr: config
                .upstream
                .addr
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("upstream.addr required when upstream.kind = HttpConnect"))?
                .parse()?,
        },
    })
}

fn parse_server_list(entries: &[String]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(entry = %s, error = %e, "skipping unparseable DNS server address");
                None
            }
        })
        .collect()
}
