//! Query/mutation surface backing the admin HTTP contract.
//!
//! The HTTP server itself (routing, SSE framing, auth) is an external
//! collaborator; this module only exposes the functions that collaborator
//! calls into: `GET /stats/dns`, `POST /stats/dns/clear`,
//! `POST /cache/dns/clear`, `GET /stats/traffic`, `POST /stats/traffic/clear`,
//! `GET /health`, and the InspectionEvent subscription behind the
//! server-sent-events stream.

use crate::dns::{DnsCache, DnsStats, DnsStatsSnapshot};
use crate::events::{EventBus, EventSubscription};
use crate::stats::{StatsRegistry, TrafficStatsSnapshot};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub uptime_secs: u64,
}

pub struct AdminApi {
    dns_stats: Arc<DnsStats>,
    dns_cache: Arc<DnsCache>,
    traffic: Arc<StatsRegistry>,
    events: Arc<EventBus>,
    started_at: std::time::Instant,
}

impl AdminApi {
    pub fn new(dns_stats: Arc<DnsStats>, dns_cache: Arc<DnsCache>, traffic: Arc<StatsRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            dns_stats,
            dns_cache,
            traffic,
            events,
            started_at: std::time::Instant::now(),
        }
    }

    /// `GET /stats/dns`.
    pub fn dns_stats(&self) -> DnsStatsSnapshot {
        self.dns_stats.snapshot()
    }

    /// `POST /stats/dns/clear`.
    pub fn clear_dns_stats(&self) {
        self.dns_stats.clear();
    }

    /// `POST /cache/dns/clear`.
    pub fn clear_dns_cache(&self) {
        self.dns_cache.clear();
    }

    /// `GET /stats/traffic`.
    pub fn traffic_stats(&self) -> TrafficStatsSnapshot {
        self.traffic.snapshot()
    }

    /// `POST /stats/traffic/clear`.
    pub fn clear_traffic_stats(&self) {
        self.traffic.clear();
    }

    /// `GET /health`.
    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            ok: true,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Backs the SSE stream: each subscriber replays recent history then
    /// receives live `InspectionEvent`s, with no backpressure on the publisher
    /// if a subscriber falls behind or disappears.
    pub fn subscribe_events(&self) -> EventSubscription {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{spawn_worker, TrafficUpdate};

    fn api() -> AdminApi {
        let dns_stats = Arc::new(DnsStats::default());
        let dns_cache = Arc::new(DnsCache::new(10));
        let traffic = StatsRegistry::new();
        let events = Arc::new(EventBus::new(8));
        AdminApi::new(dns_stats, dns_cache, traffic, events)
    }

    #[test]
    fn health_reports_ok() {
        assert!(api().health().ok);
    }

    #[tokio::test]
    async fn clear_dns_stats_resets_counters() {
        let admin = api();
        admin.dns_stats.hits.fetch_add(5, std::sync::atomic::Ordering::Relaxed);
        admin.clear_dns_stats();
        assert_eq!(admin.dns_stats().hits, 0);
    }

    #[tokio::test]
    async fn clear_dns_cache_empties_it() {
        let admin = api();
        admin.dns_cache.insert("example.com", 1, vec![1, 2, 3], std::time::Duration::from_secs(60));
        admin.clear_dns_cache();
        assert_eq!(admin.dns_cache.get("example.com", 1), None);
    }

    #[tokio::test]
    async fn traffic_stats_reflect_recorded_updates_and_clear() {
        let dns_stats = Arc::new(DnsStats::default());
        let dns_cache = Arc::new(DnsCache::new(10));
        let traffic = StatsRegistry::new();
        let tx = spawn_worker(traffic.clone(), 16);
        let events = Arc::new(EventBus::new(8));
        let admin = AdminApi::new(dns_stats, dns_cache, traffic, events);

        tx.send(TrafficUpdate { identifier: "example.com".into(), is_domain: true, upload: 10, download: 20 })
            .await
            .unwrap();
        drop(tx);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(admin.traffic_stats().records.len(), 1);
        admin.clear_traffic_stats();
        assert_eq!(admin.traffic_stats().records.len(), 0);
    }
}
