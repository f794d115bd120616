//! Root CA lifecycle (spec §3 `RootCA`, §4.2 `ensure_root`).

use crate::error::CoreError;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tracing::info;

pub struct RootCa {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub key_pem: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub fingerprint_sha256: [u8; 32],
    pub(super) issuer_cert: Certificate,
    pub(super) issuer_key: KeyPair,
}

const CA_COMMON_NAME: &str = "Linko MITM CA";

impl RootCa {
    /// Loads the root CA from `ca_cert_path`/`ca_key_path` if both exist and
    /// parse; otherwise generates a fresh one with `ca_validity` and
    /// persists it (key file at mode 0600).
    pub fn ensure(ca_cert_path: &Path, ca_key_path: &Path, ca_validity: Duration) -> Result<Self, CoreError> {
        if ca_cert_path.exists() && ca_key_path.exists() {
            match Self::load(ca_cert_path, ca_key_path) {
                Ok(ca) => {
                    info!(path = %ca_cert_path.display(), "loaded existing root CA");
                    return Ok(ca);
                }
                Err(e) => {
                    return Err(CoreError::CaLoadError(e.to_string()));
                }
            }
        }
        let ca = Self::generate(ca_validity).map_err(|e| CoreError::CaGenerateError(e.to_string()))?;
        ca.persist(ca_cert_path, ca_key_path)
            .map_err(|e| CoreError::CaGenerateError(format!("generated but failed to persist: {e}")))?;
        info!(path = %ca_cert_path.display(), "generated new root CA");
        Ok(ca)
    }

    fn generate(ca_validity: Duration) -> Result<Self, anyhow::Error> {
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(rcgen::SerialNumber::from(random_serial().to_vec()));

        let now = OffsetDateTime::now_utc();
        let not_before = now;
        let not_after = now + time::Duration::seconds(ca_validity.as_secs() as i64);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.self_signed(&key_pair)?;
        let cert_der = cert.der().to_vec();
        let fingerprint_sha256 = Sha256::digest(&cert_der).into();

        Ok(Self {
            cert_pem: cert.pem(),
            cert_der,
            key_pem: key_pair.serialize_pem(),
            not_before: not_before.into(),
            not_after: not_after.into(),
            fingerprint_sha256,
            issuer_cert: cert,
            issuer_key: key_pair,
        })
    }

    fn load(ca_cert_path: &Path, ca_key_path: &Path) -> Result<Self, anyhow::Error> {
        let cert_pem = std::fs::read_to_string(ca_cert_path)?;
        let key_pem = std::fs::read_to_string(ca_key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let not_before: SystemTime = params.not_before.into();
        let not_after: SystemTime = params.not_after.into();
        let cert = params.self_signed(&key_pair)?;
        let cert_der = cert.der().to_vec();
        let fingerprint_sha256 = Sha256::digest(&cert_der).into();

        Ok(Self {
            cert_pem,
            cert_der,
            key_pem,
            not_before,
            not_after,
            fingerprint_sha256,
            issuer_cert: cert,
            issuer_key: key_pair,
        })
    }

    fn persist(&self, ca_cert_path: &Path, ca_key_path: &Path) -> std::io::Result<()> {
        if let Some(parent) = ca_cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(ca_cert_path, &self.cert_pem)?;
        write_private_key(ca_key_path, &self.key_pem)
    }
}

fn random_serial() -> [u8; 20] {
    use rand::RngCore;
    let mut buf = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut buf);
    buf[0] &= 0x7f;
    buf
}

#[cfg(unix)]
fn write_private_key(path: &Path, contents: &str) -> std::io::Result<()> {
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
fn write_private_key(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
