//! Error taxonomy for the intercepting proxy core.
//!
//! Every connection- or query-scoped variant carries enough context
//! (`connection_id`, `host`) to correlate a log line with a live session
//! without re-deriving it from the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("sniff timed out on connection {connection_id}")]
    SnifferTimeout { connection_id: u64 },

    #[error("sniff failed to parse peeked bytes on connection {connection_id}: {reason}")]
    SnifferProtocolError { connection_id: u64, reason: String },

    #[error("no original destination for connection {connection_id}")]
    NoOriginalDst { connection_id: u64 },

    #[error("failed to load root CA: {0}")]
    CaLoadError(String),

    #[error("failed to generate root CA: {0}")]
    CaGenerateError(String),

    #[error("failed to serialize certificate material: {0}")]
    CaSerializeError(String),

    #[error("failed to sign leaf certificate for {host}: {reason}")]
    LeafSignError { host: String, reason: String },

    #[error("failed to persist leaf cert cache entry for {host}: {reason}")]
    CacheWriteError { host: String, reason: String },

    #[error("upstream connect failed ({kind}){code}", code = .code.map(|c| format!(", code={c}")).unwrap_or_default())]
    UpstreamConnectError { kind: String, code: Option<u8> },

    #[error("origin TLS handshake failed for {host}: {reason}")]
    OriginTlsError { host: String, reason: String },

    #[error("DNS upstream query timed out for {qname}")]
    DnsUpstreamTimeout { qname: String },

    #[error("DNS upstream refused query for {qname}")]
    DnsUpstreamRefused { qname: String },

    #[error("no DNS answer for {qname}")]
    DnsNoAnswer { qname: String },

    #[error("relay closed: {0}")]
    RelayClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this variant is one that should abandon only the current
    /// connection/query rather than anything broader (per §7 "Propagation").
    pub fn is_connection_scoped(&self) -> bool {
        !matches!(self, CoreError::CaLoadError(_) | CoreError::CaGenerateError(_))
    }

    /// Whether the retry policy (§7 "Retry policy") should burn another
    /// attempt on this error: connection refused/reset, unreachable, or
    /// timed out. Anything else (bad SOCKS greeting, non-200 CONNECT, a
    /// protocol-level SOCKS failure code) surfaces immediately.
    pub fn is_retryable_connect_error(&self) -> bool {
        match self {
            CoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::NotConnected
            ) || matches!(e.raw_os_error(), Some(101) | Some(113)), // ENETUNREACH, EHOSTUNREACH
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_is_retryable() {
        let err = CoreError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(err.is_retryable_connect_error());
    }

    #[test]
    fn socks5_protocol_failure_code_is_not_retryable() {
        let err = CoreError::UpstreamConnectError {
            kind: "socks5".to_string(),
            code: Some(0x01),
        };
        assert!(!err.is_retryable_connect_error());
    }

    #[test]
    fn unexpected_eof_is_not_retryable() {
        let err = CoreError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(!err.is_retryable_connect_error());
    }
}
