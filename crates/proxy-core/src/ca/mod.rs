//! Certificate authority & leaf cache (spec §4.2, C2).
//!
//! `CertificateAuthority` owns the root CA keypair and a lazily-populated
//! leaf cache, single-flighted per host so a slow RSA/ECDSA sign for one
//! hostname never blocks a concurrent mint for another (spec §9
//! "Certificate minting single-flight").

mod host;
mod root;

pub use host::Host;
pub use root::RootCa;

use crate::error::{CoreError, Result};
use dashmap::DashMap;
use rcgen::{CertificateParams, DnType, KeyPair, KeyUsagePurpose, SanType};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LeafCert {
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
    pub key_pem: String,
    pub host: Host,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub fingerprint: String,
}

pub struct CertificateAuthority {
    root: RootCa,
    cache: DashMap<String, Arc<LeafCert>>,
    mint_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    persist_dir: Option<PathBuf>,
    site_cert_validity: Duration,
    refresh_margin: Duration,
}

impl CertificateAuthority {
    pub fn new(root: RootCa, site_cert_validity: Duration, refresh_margin: Duration, persist_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &persist_dir {
            if let Err(e) = std::fs::create_dir_all(dir.join("sites")) {
                warn!(error = %e, "failed to create leaf cache directory; persistence disabled for this run");
            }
        }
        Self {
            root,
            cache: DashMap::new(),
            mint_locks: DashMap::new(),
            persist_dir,
            site_cert_validity,
            refresh_margin,
        }
    }

    pub fn root(&self) -> &RootCa {
        &self.root
    }

    pub fn export_ca_pem(&self) -> Vec<u8> {
        self.root.cert_pem.clone().into_bytes()
    }

    pub fn export_ca_der(&self) -> Vec<u8> {
        self.root.cert_der.clone()
    }

    pub fn ca_fingerprint_sha256(&self) -> [u8; 32] {
        self.root.fingerprint_sha256
    }

    /// Returns a fresh, cached leaf for `host`, minting (and persisting) one
    /// if needed. At most one mint runs concurrently per host; other callers
    /// for the same host await the in-flight mint and share its result.
    pub async fn leaf_for(&self, host: &Host) -> Result<Arc<LeafCert>> {
        let key = host.cache_key();

        if let Some(existing) = self.cache.get(&key) {
            if !self.needs_refresh(&existing) {
                return Ok(existing.clone());
            }
        }

        let lock = self
            .mint_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another caller may have minted while we waited for the lock.
        if let Some(existing) = self.cache.get(&key) {
            if !self.needs_refresh(&existing) {
                return Ok(existing.clone());
            }
        }

        if let Some(loaded) = self.load_persisted(host) {
            if !self.needs_refresh(&loaded) {
                let loaded = Arc::new(loaded);
                self.cache.insert(key, loaded.clone());
                return Ok(loaded);
            }
        }

        let leaf = self.mint(host)?;
        let leaf = Arc::new(leaf);
        self.cache.insert(key, leaf.clone());
        self.persist(&leaf);
        Ok(leaf)
    }

    fn needs_refresh(&self, leaf: &LeafCert) -> bool {
        match leaf.not_after.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining <= self.refresh_margin,
            Err(_) => true,
        }
    }

    fn mint(&self, host: &Host) -> Result<LeafCert> {
        let key_pair = KeyPair::generate().map_err(|e| CoreError::LeafSignError {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| CoreError::LeafSignError {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        params.distinguished_name.push(DnType::CommonName, host.to_string());
        params.subject_alt_names = vec![host.to_san_type().map_err(|e| CoreError::LeafSignError {
            host: host.to_string(),
            reason: e,
        })?];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(rcgen::SerialNumber::from(random_serial().to_vec()));

        let now = OffsetDateTime::now_utc();
        let not_before = now - time::Duration::minutes(5);
        let not_after = now + time::Duration::seconds(self.site_cert_validity.as_secs() as i64);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key_pair, &self.root.issuer_cert, &self.root.issuer_key)
            .map_err(|e| CoreError::LeafSignError {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let cert_pem = cert.pem();
        let cert_der = cert.der().to_vec();
        let key_pem = key_pair.serialize_pem();
        let fingerprint = hex::encode(Sha256::digest(&cert_der));

        debug!(host = %host, %fingerprint, "minted leaf certificate");

        Ok(LeafCert {
            cert_der,
            cert_pem,
            key_pem,
            host: host.clone(),
            not_before: not_before.into(),
            not_after: not_after.into(),
            fingerprint,
        })
    }

    fn site_paths(&self, host: &Host) -> Option<(PathBuf, PathBuf)> {
        let dir = self.persist_dir.as_ref()?.join("sites");
        let sanitized = sanitize_filename(&host.to_string());
        Some((dir.join(format!("{sanitized}.crt")), dir.join(format!("{sanitized}.key"))))
    }

    fn persist(&self, leaf: &LeafCert) {
        let Some((cert_path, key_path)) = self.site_paths(&leaf.host) else {
            return;
        };
        if let Err(e) = std::fs::write(&cert_path, &leaf.cert_pem) {
            warn!(host = %leaf.host, error = %e, "failed to persist leaf cert (mint still succeeds)");
            return;
        }
        if let Err(e) = write_private(&key_path, &leaf.key_pem) {
            warn!(host = %leaf.host, error = %e, "failed to persist leaf key (mint still succeeds)");
        }
    }

    fn load_persisted(&self, host: &Host) -> Option<LeafCert> {
        let (cert_path, key_path) = self.site_paths(host)?;
        let cert_pem = std::fs::read_to_string(&cert_path).ok()?;
        let key_pem = std::fs::read_to_string(&key_path).ok()?;
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()?
            .ok()?
            .to_vec();
        let fingerprint = hex::encode(Sha256::digest(&cert_der));
        // We don't re-derive exact validity bounds from the DER (no X.509
        // parser in this dependency set); treat a loaded leaf as fresh for
        // one refresh_margin window and let the next call re-mint if that
        // guess was wrong. This only affects restart behavior, never
        // correctness of in-flight mints.
        let not_after = SystemTime::now() + self.site_cert_validity;
        info!(host = %host, "loaded persisted leaf certificate");
        Some(LeafCert {
            cert_der,
            cert_pem,
            key_pem,
            host: host.clone(),
            not_before: SystemTime::now(),
            not_after,
            fingerprint,
        })
    }
}

fn random_serial() -> [u8; 20] {
    use rand::RngCore;
    let mut buf = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut buf);
    buf[0] &= 0x7f; // keep the serial positive per DER INTEGER encoding
    buf
}

fn sanitize_filename(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    std::io::Write::write_all(&mut file, contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile_like::TempDir;

    #[tokio::test]
    async fn leaf_for_same_host_mints_once_and_shares_result() {
        let (ca, _dir) = test_ca();
        let host = Host::Dns("api.openai.com".to_string());

        let (a, b) = tokio::join!(ca.leaf_for(&host), ca.leaf_for(&host));
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.cert_der, b.cert_der);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[tokio::test]
    async fn leaf_sans_match_the_requested_host() {
        let (ca, _dir) = test_ca();
        let host = Host::Ip(std::net::IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        let leaf = ca.leaf_for(&host).await.unwrap();
        assert_eq!(leaf.host, host);
    }

    #[tokio::test]
    async fn different_hosts_mint_independently() {
        let (ca, _dir) = test_ca();
        let a = ca.leaf_for(&Host::Dns("a.example.com".into())).await.unwrap();
        let b = ca.leaf_for(&Host::Dns("b.example.com".into())).await.unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    fn test_ca() -> (CertificateAuthority, TempDir) {
        let dir = TempDir::new();
        let root = RootCa::ensure(&dir.path().join("ca.crt"), &dir.path().join("ca.key"), Duration::from_secs(3600 * 24 * 365)).unwrap();
        let ca = CertificateAuthority::new(root, Duration::from_secs(7 * 24 * 3600), Duration::from_secs(3600), Some(dir.path().to_path_buf()));
        (ca, dir)
    }

    /// Minimal temp-directory helper so tests don't reach for an extra
    /// dev-dependency just for this.
    mod tempfile_like {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut path = std::env::temp_dir();
                let unique = format!("linko-ca-test-{}-{}", std::process::id(), rand::random::<u64>());
                path.push(unique);
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }
}
