//! MITM engine (C3): terminate TLS toward the client with a freshly minted
//! leaf, open a TLS session to the real origin, and either relay opaquely
//! or capture HTTP/1.1 request/response pairs.

mod http1;

use crate::ca::{CertificateAuthority, Host, LeafCert};
use crate::error::{CoreError, Result};
use crate::events::{Direction, EventBus, InspectionEvent};
use crate::platform::OriginalDestination;
use crate::relay::{self, RelayResult};
use crate::retry;
use crate::upstream::UpstreamClient;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Max attempts for the shared retry policy (§7 "Retry policy") applied to
/// the origin-side upstream connect.
const UPSTREAM_CONNECT_ATTEMPTS: usize = 3;

pub struct MitmEngine {
    ca: Arc<CertificateAuthority>,
    upstream: UpstreamClient,
    events: Arc<EventBus>,
    max_body_size: usize,
    origin_tls_timeout: Duration,
    root_store: Arc<RootCertStore>,
}

impl MitmEngine {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        upstream: UpstreamClient,
        events: Arc<EventBus>,
        max_body_size: usize,
        origin_tls_timeout: Duration,
    ) -> Result<Self> {
        let mut store = RootCertStore::empty();
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            warn!(error = %err, "skipping unreadable native root cert");
        }
        for cert in loaded.certs {
            if let Err(e) = store.add(cert) {
                warn!(error = %e, "skipping invalid native root cert");
            }
        }
        Ok(Self {
            ca,
            upstream,
            events,
            max_body_size,
            origin_tls_timeout,
            root_store: Arc::new(store),
        })
    }

    /// Determines the MITM identity for a connection: prefer the sniffed
    /// SNI/Host, otherwise fall back to the destination IP literal.
    /// Reverse-DNS of `original_dst.ip` would be a further fallback but
    /// requires a resolver this engine does not own; the IP literal covers
    /// the same "something usable" need.
    fn resolve_host(&self, original_dst: &OriginalDestination, sniffed_host: Option<&str>) -> Host {
        match sniffed_host {
            Some(h) => Host::parse(h),
            None => Host::Ip(original_dst.ip),
        }
    }

    /// Runs the full MITM sequence for one accepted connection. `client_conn`
    /// must already have replayed any bytes peeked during sniffing (see
    /// `PeekReader`) so the TLS acceptor sees a complete ClientHello.
    pub async fn handle<C>(
        &self,
        client_conn: C,
        original_dst: OriginalDestination,
        sniffed_host: Option<String>,
        connection_id: u64,
    ) -> Result<RelayResult>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let host = self.resolve_host(&original_dst, sniffed_host.as_deref());
        let fingerprint = host.cache_key();

        let result = self.handle_inner(client_conn, &original_dst, &host, connection_id).await;
        if let Err(e) = &result {
            warn!(connection_id, host = %host, error = %e, "MITM session failed");
            self.events
                .publish(InspectionEvent::new(Direction::Error, fingerprint));
        }
        result
    }

    async fn handle_inner<C>(
        &self,
        client_conn: C,
        original_dst: &OriginalDestination,
        host: &Host,
        connection_id: u64,
    ) -> Result<RelayResult>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let leaf = match self.ca.leaf_for(host).await {
            Ok(leaf) => leaf,
            Err(e @ CoreError::LeafSignError { .. }) => {
                warn!(connection_id, host = %host, error = %e, "leaf mint failed; downgrading to opaque relay");
                let origin_tcp = self.dial_origin(original_dst).await?;
                return Ok(relay::relay(client_conn, origin_tcp).await);
            }
            Err(e) => return Err(e),
        };

        let origin_tcp = self.dial_origin(original_dst).await?;

        let client_config = Arc::new(build_client_config(self.root_store.clone()));
        let connector = TlsConnector::from(client_config);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| CoreError::OriginTlsError {
                host: host.to_string(),
                reason: "invalid server name for SNI".to_string(),
            })?;

        let origin_tls = tokio::time::timeout(self.origin_tls_timeout, connector.connect(server_name, origin_tcp))
            .await
            .map_err(|_| CoreError::OriginTlsError {
                host: host.to_string(),
                reason: "handshake timed out".to_string(),
            })?
            .map_err(|e| CoreError::OriginTlsError {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let server_config = build_server_config(&leaf)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let client_tls = acceptor.accept(client_conn).await.map_err(CoreError::Io)?;

        let origin_alpn = origin_tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        debug!(connection_id, host = %host, alpn = ?origin_alpn, "origin TLS established");

        match origin_alpn.as_deref() {
            None | Some(ALPN_HTTP1) => {
                http1::run(client_tls, origin_tls, &self.events, self.max_body_size, host.to_string(), connection_id).await
            }
            Some(_) => Ok(relay::relay(client_tls, origin_tls).await),
        }
    }

    /// Dials the origin at `original_dst` (spec §4.3 step 4: the proxy's
    /// actual intercepted destination), never at the sniffed hostname — a
    /// hostname redial would re-resolve DNS and could land on a different
    /// IP than the client's connection, defeating transparency.
    async fn dial_origin(&self, original_dst: &OriginalDestination) -> Result<TcpStream> {
        let ip_literal = original_dst.ip.to_string();
        retry::with_backoff(
            UPSTREAM_CONNECT_ATTEMPTS,
            || self.upstream.connect(&ip_literal, original_dst.port),
            CoreError::is_retryable_connect_error,
        )
        .await
    }
}

fn build_server_config(leaf: &LeafCert) -> Result<ServerConfig> {
    let cert_der = CertificateDer::from(leaf.cert_der.clone());
    let key_der = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
        .map_err(|e| CoreError::LeafSignError {
            host: leaf.host.to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CoreError::LeafSignError {
            host: leaf.host.to_string(),
            reason: "no private key found in leaf PEM".to_string(),
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| CoreError::LeafSignError {
            host: leaf.host.to_string(),
            reason: e.to_string(),
        })?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(config)
}

/// The origin connector only ever offers `http/1.1`: HTTP/2-aware
/// interception is an explicit non-goal, so flows that would otherwise
/// negotiate it are steered toward the one protocol this engine can parse.
fn build_client_config(root_store: Arc<RootCertStore>) -> ClientConfig {
    let mut config = ClientConfig::builder()
        .with_root_certificates((*root_store).clone())
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::RootCa;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("linko-mitm-test-{}-{}", std::process::id(), rand::random::<u64>()));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn build_server_config_accepts_a_minted_leaf() {
        let dir = TempDir::new();
        let root = RootCa::ensure(&dir.0.join("ca.crt"), &dir.0.join("ca.key"), Duration::from_secs(3600)).unwrap();
        let ca = CertificateAuthority::new(root, Duration::from_secs(3600), Duration::from_secs(60), None);
        let host = Host::Dns("example.com".to_string());
        let leaf = ca.leaf_for(&host).await.unwrap();

        let config = build_server_config(&leaf).expect("server config should build from a freshly minted leaf");
        assert_eq!(config.alpn_protocols, vec![ALPN_HTTP1.to_vec()]);
    }

    #[test]
    fn resolve_host_prefers_sniffed_identity_over_ip() {
        let engine_host = Host::parse("api.openai.com");
        assert_eq!(engine_host, Host::Dns("api.openai.com".to_string()));
        let fallback = Host::Ip(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_ne!(engine_host, fallback);
    }
}
