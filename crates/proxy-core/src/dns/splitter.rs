//! Domestic/foreign race plus the answer-selection rule.
//!
//! Both groups race with a plain `tokio::spawn` + `mpsc` "first reply wins"
//! pattern rather than a `futures::future::select_ok`/`FuturesUnordered`
//! combinator: nothing else in this crate pulls in `futures` for racing (the
//! leaf cache's per-host single-flight and the event bus both hand-roll
//! their own coordination too), so this keeps the same shape without a new
//! dependency.

use crate::error::{CoreError, Result};
use crate::geo::GeoClassifier;
use crate::upstream::UpstreamClient;
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

const RACE_DEADLINE: Duration = Duration::from_secs(5);
const UDP_RECV_BUF: usize = 4096;

#[derive(Default)]
pub struct DnsStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub domestic_selected: AtomicU64,
    pub foreign_selected: AtomicU64,
    pub servfail: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub domestic_selected: u64,
    pub foreign_selected: u64,
    pub servfail: u64,
}

impl DnsStats {
    pub fn snapshot(&self) -> DnsStatsSnapshot {
        DnsStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            domestic_selected: self.domestic_selected.load(Ordering::Relaxed),
            foreign_selected: self.foreign_selected.load(Ordering::Relaxed),
            servfail: self.servfail.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.domestic_selected.store(0, Ordering::Relaxed);
        self.foreign_selected.store(0, Ordering::Relaxed);
        self.servfail.store(0, Ordering::Relaxed);
    }
}

/// Runs the race-and-select algorithm over one decoded query.
pub struct DnsSplitter {
    domestic_servers: Vec<SocketAddr>,
    foreign_servers: Vec<SocketAddr>,
    tcp_for_foreign: bool,
    geo: Arc<dyn GeoClassifier>,
    upstream: UpstreamClient,
    stats: Arc<DnsStats>,
    min_ttl: Duration,
    max_ttl: Duration,
}

impl DnsSplitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domestic_servers: Vec<SocketAddr>,
        foreign_servers: Vec<SocketAddr>,
        tcp_for_foreign: bool,
        geo: Arc<dyn GeoClassifier>,
        upstream: UpstreamClient,
        stats: Arc<DnsStats>,
        min_ttl: Duration,
        max_ttl: Duration,
    ) -> Self {
        Self {
            domestic_servers,
            foreign_servers,
            tcp_for_foreign,
            geo,
            upstream,
            stats,
            min_ttl,
            max_ttl,
        }
    }

    pub fn stats(&self) -> &Arc<DnsStats> {
        &self.stats
    }

    /// Resolves one query, returning the chosen reply message and the TTL to
    /// cache it under, or `None` when the selection rule bottoms out at
    /// SERVFAIL.
    pub async fn resolve(&self, query: &Message) -> Option<(Message, Duration)> {
        let qname = query.queries().first().map(|q| q.name().to_string()).unwrap_or_default();

        let (domestic, foreign) = tokio::join!(
            race_group(&self.domestic_servers, query, false, &self.upstream),
            race_group(&self.foreign_servers, query, self.tcp_for_foreign, &self.upstream),
        );

        let domestic_has_china_answer =
            domestic.as_ref().is_some_and(|m| has_china_answer(m, self.geo.as_ref()));

        let selected = if domestic_has_china_answer {
            self.stats.domestic_selected.fetch_add(1, Ordering::Relaxed);
            domestic
        } else if let Some(foreign_msg) = foreign {
            self.stats.foreign_selected.fetch_add(1, Ordering::Relaxed);
            Some(foreign_msg)
        } else if let Some(domestic_msg) = domestic {
            self.stats.domestic_selected.fetch_add(1, Ordering::Relaxed);
            Some(domestic_msg)
        } else {
            None
        };

        match selected {
            Some(message) => {
                let ttl = min_rr_ttl(&message).unwrap_or(self.min_ttl).clamp(self.min_ttl, self.max_ttl);
                Some((message, ttl))
            }
            None => {
                debug!(qname, "DNS split produced no usable answer; replying SERVFAIL");
                self.stats.servfail.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

fn has_china_answer(message: &Message, geo: &dyn GeoClassifier) -> bool {
    message.answers().iter().any(|record| {
        record.record_type() == RecordType::A
            && matches!(record.data(), Some(RData::A(addr)) if geo.is_china_ip(std::net::IpAddr::V4(addr.0)))
    })
}

fn min_rr_ttl(message: &Message) -> Option<Duration> {
    message.answers().iter().map(|r| r.ttl()).min().map(|t| Duration::from_secs(u64::from(t)))
}

/// Races one query per server in `servers`; the first to answer wins the
/// group. The 5-second deadline bounds the whole group, not each member — a
/// slow server just loses the race silently.
async fn race_group(
    servers: &[SocketAddr],
    query: &Message,
    via_tcp: bool,
    upstream: &UpstreamClient,
) -> Option<Message> {
    if servers.is_empty() {
        return None;
    }
    let wire = query.to_bytes().ok()?;
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(servers.len());
    let mut handles = Vec::with_capacity(servers.len());
    for &server in servers {
        let tx = tx.clone();
        let wire = wire.clone();
        let upstream = upstream.clone();
        handles.push(tokio::spawn(async move {
            let outcome = if via_tcp { query_tcp(server, &wire, &upstream).await } else { query_udp(server, &wire).await };
            if let Ok(bytes) = outcome {
                let _ = tx.send(bytes).await;
            }
        }));
    }
    drop(tx);

    let winner = tokio::time::timeout(RACE_DEADLINE, rx.recv()).await.ok().flatten();
    for handle in handles {
        handle.abort();
    }
    winner.and_then(|bytes| Message::from_bytes(&bytes).ok())
}

async fn query_udp(server: SocketAddr, wire: &[u8]) -> Result<Vec<u8>> {
    let local_any: SocketAddr = if server.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
    let socket = UdpSocket::bind(local_any).await.map_err(CoreError::Io)?;
    socket.connect(server).await.map_err(CoreError::Io)?;
    socket.send(wire).await.map_err(CoreError::Io)?;
    let mut buf = vec![0u8; UDP_RECV_BUF];
    let n = socket.recv(&mut buf).await.map_err(CoreError::Io)?;
    buf.truncate(n);
    Ok(buf)
}

/// Two-byte length-prefixed DNS-over-TCP (RFC 1035 §4.2.2), dialed through
/// the same upstream tunnel client C3/C4 use, so foreign queries can be
/// routed through the same outbound proxy as ordinary traffic.
async fn query_tcp(server: SocketAddr, wire: &[u8], upstream: &UpstreamClient) -> Result<Vec<u8>> {
    let mut stream = upstream.connect(&server.ip().to_string(), server.port()).await?;
    let len = u16::try_from(wire.len()).map_err(|_| CoreError::DnsUpstreamRefused { qname: String::new() })?;
    stream.write_all(&len.to_be_bytes()).await.map_err(CoreError::Io)?;
    stream.write_all(wire).await.map_err(CoreError::Io)?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(CoreError::Io)?;
    let reply_len = u16::from_be_bytes(len_buf) as usize;
    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await.map_err(CoreError::Io)?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::StaticGeoClassifier;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn sample_query() -> Message {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        message
    }

    #[tokio::test]
    async fn resolve_returns_none_when_both_groups_are_empty() {
        let splitter = DnsSplitter::new(
            Vec::new(),
            Vec::new(),
            false,
            Arc::new(StaticGeoClassifier::new(Vec::new())),
            UpstreamClient::Disabled,
            Arc::new(DnsStats::default()),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        let result = splitter.resolve(&sample_query()).await;
        assert!(result.is_none());
        assert_eq!(splitter.stats().snapshot().servfail, 1);
    }

    #[test]
    fn stats_snapshot_reflects_cleared_state() {
        let stats = DnsStats::default();
        stats.hits.fetch_add(3, Ordering::Relaxed);
        stats.clear();
        assert_eq!(stats.snapshot().hits, 0);
    }
}
