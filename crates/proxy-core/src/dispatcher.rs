//! Transparent dispatcher (spec §4.4, C4): recover the original destination,
//! sniff an identifier from the first bytes, and route the flow to direct
//! relay, upstream-tunnel relay, or the MITM engine.

use crate::error::{CoreError, Result};
use crate::geo::GeoClassifier;
use crate::mitm::MitmEngine;
use crate::peek::PeekReader;
use crate::platform::{OriginalDestination, PlatformCapability};
use crate::relay::{self, RelayResult};
use crate::retry;
use crate::sniff::{sniff_host, sniff_sni};
use crate::stats::TrafficUpdate;
use crate::upstream::UpstreamClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info_span, Instrument};

const PEEK_MAX_BYTES: usize = 4096;
const PEEK_DEADLINE: Duration = Duration::from_secs(2);

/// Max attempts for the shared retry policy (§7 "Retry policy"): 3 tries,
/// exponential backoff starting 1s.
const UPSTREAM_CONNECT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyDecision {
    Direct,
    Upstream,
    Mitm,
}

pub struct Dispatcher {
    capability: Box<dyn PlatformCapability>,
    mitm: Option<Arc<MitmEngine>>,
    mitm_whitelist: Vec<String>,
    upstream: UpstreamClient,
    upstream_enabled: bool,
    geo: Arc<dyn GeoClassifier>,
    traffic_tx: mpsc::Sender<TrafficUpdate>,
}

impl Dispatcher {
    pub fn new(
        capability: Box<dyn PlatformCapability>,
        mitm: Option<Arc<MitmEngine>>,
        mitm_whitelist: Vec<String>,
        upstream: UpstreamClient,
        upstream_enabled: bool,
        geo: Arc<dyn GeoClassifier>,
        traffic_tx: mpsc::Sender<TrafficUpdate>,
    ) -> Self {
        Self {
            capability,
            mitm,
            mitm_whitelist,
            upstream,
            upstream_enabled,
            geo,
            traffic_tx,
        }
    }

    /// Runs the full per-connection algorithm (spec §4.4 steps 1-6). Errors
    /// returned here are connection-scoped: the caller should log and drop,
    /// never propagate to other connections.
    pub async fn handle_connection(&self, conn: TcpStream, connection_id: u64) -> Result<()> {
        let span = info_span!("connection", connection_id, dst_port = tracing::field::Empty);
        self.handle_connection_inner(conn, connection_id).instrument(span).await
    }

    async fn handle_connection_inner(&self, conn: TcpStream, connection_id: u64) -> Result<()> {
        let dst = self.capability.recover_dst(&conn, connection_id)?;
        tracing::Span::current().record("dst_port", dst.port);

        let mut peek_reader = PeekReader::new(conn);
        let peeked = peek_reader.peek(PEEK_MAX_BYTES, PEEK_DEADLINE).await.map_err(CoreError::Io)?;
        let (identifier, is_domain) = sniff_identifier(dst.port, peeked, connection_id, dst.ip.to_string());

        let decision = self.decide(&dst, &identifier);
        debug!(connection_id, identifier = %identifier, ?decision, "dispatch decision");

        let outcome = match decision {
            ProxyDecision::Mitm => {
                let mitm = self.mitm.as_ref().expect("Mitm decision implies mitm engine is configured");
                let sniffed = is_domain.then(|| identifier.clone());
                mitm.handle(peek_reader, dst, sniffed, connection_id).await
            }
            ProxyDecision::Upstream => self.relay_via(&dst, peek_reader).await,
            ProxyDecision::Direct => self.relay_direct(&dst, peek_reader).await,
        };

        match outcome {
            Ok(result) => {
                self.report_traffic(identifier, is_domain, result);
                Ok(())
            }
            Err(e) => {
                self.report_traffic(identifier, is_domain, RelayResult::default());
                Err(e)
            }
        }
    }

    async fn relay_direct(&self, dst: &OriginalDestination, client: PeekReader<TcpStream>) -> Result<RelayResult> {
        let origin = TcpStream::connect((dst.ip, dst.port)).await.map_err(CoreError::Io)?;
        Ok(relay::relay(client, origin).await)
    }

    async fn relay_via(&self, dst: &OriginalDestination, client: PeekReader<TcpStream>) -> Result<RelayResult> {
        let ip_literal = dst.ip.to_string();
        let origin = retry::with_backoff(
            UPSTREAM_CONNECT_ATTEMPTS,
            || self.upstream.connect(&ip_literal, dst.port),
            CoreError::is_retryable_connect_error,
        )
        .await?;
        Ok(relay::relay(client, origin).await)
    }

    fn decide(&self, dst: &OriginalDestination, identifier: &str) -> ProxyDecision {
        if self.mitm.is_some()
            && dst.port == 443
            && (self.mitm_whitelist.is_empty() || whitelist_matches(identifier, &self.mitm_whitelist))
        {
            return ProxyDecision::Mitm;
        }
        if self.upstream_enabled && !self.geo.is_domestic(dst.ip) {
            return ProxyDecision::Upstream;
        }
        ProxyDecision::Direct
    }

    fn report_traffic(&self, identifier: String, is_domain: bool, result: RelayResult) {
        let update = TrafficUpdate {
            identifier,
            is_domain,
            upload: result.upload,
            download: result.download,
        };
        // Drop-on-full: a burst of completed connections must never block
        // the dispatcher (spec §5).
        if self.traffic_tx.try_send(update).is_err() {
            debug!("traffic stats channel full; dropping update");
        }
    }
}

/// Sniffs SNI (port 443) or `Host:` (port 80); any parse failure, or any
/// other port, falls back to the destination IP literal (spec §4.4 step 3).
fn sniff_identifier(port: u16, peeked: &[u8], connection_id: u64, ip_literal: String) -> (String, bool) {
    match port {
        443 => match sniff_sni(peeked, connection_id) {
            Ok(host) => (host, true),
            Err(_) => (ip_literal, false),
        },
        80 => match sniff_host(peeked, connection_id) {
            Ok(host) => (host, true),
            Err(_) => (ip_literal, false),
        },
        _ => (ip_literal, false),
    }
}

/// Suffix-or-exact whitelist rule (spec §4.4): `*.example.com` matches
/// `a.example.com` and bare `example.com`; any other entry (including IP
/// literals) matches only exactly. Case-insensitive.
fn whitelist_matches(identifier: &str, whitelist: &[String]) -> bool {
    let identifier = identifier.to_ascii_lowercase();
    whitelist.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        match entry.strip_prefix("*.") {
            Some(suffix) => identifier == suffix || identifier.ends_with(&format!(".{suffix}")),
            None => identifier == entry,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_wildcard_matches_subdomain_and_bare_domain() {
        let whitelist = vec!["*.example.com".to_string()];
        assert!(whitelist_matches("a.example.com", &whitelist));
        assert!(whitelist_matches("example.com", &whitelist));
        assert!(!whitelist_matches("notexample.com", &whitelist));
    }

    #[test]
    fn whitelist_plain_entry_matches_exactly() {
        let whitelist = vec!["api.openai.com".to_string()];
        assert!(whitelist_matches("api.openai.com", &whitelist));
        assert!(!whitelist_matches("sub.api.openai.com", &whitelist));
    }

    #[test]
    fn whitelist_ip_literal_matches_only_that_ip() {
        let whitelist = vec!["93.184.216.34".to_string()];
        assert!(whitelist_matches("93.184.216.34", &whitelist));
        assert!(!whitelist_matches("93.184.216.35", &whitelist));
    }

    #[test]
    fn whitelist_match_is_case_insensitive() {
        let whitelist = vec!["*.Example.COM".to_string()];
        assert!(whitelist_matches("a.example.com", &whitelist));
    }

    #[test]
    fn sniff_identifier_falls_back_to_ip_on_unparseable_peek() {
        let (identifier, is_domain) = sniff_identifier(443, b"not a tls record", 1, "1.2.3.4".to_string());
        assert_eq!(identifier, "1.2.3.4");
        assert!(!is_domain);
    }

    #[test]
    fn sniff_identifier_ignores_sniffing_on_other_ports() {
        let (identifier, is_domain) = sniff_identifier(22, b"SSH-2.0-OpenSSH", 1, "1.2.3.4".to_string());
        assert_eq!(identifier, "1.2.3.4");
        assert!(!is_domain);
    }
}
