//! Canonical SAN key (spec §3 `LeafCache`, §9 "single canonical form").

use rcgen::SanType;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Dns(String),
    Ip(IpAddr),
}

impl Host {
    /// Parses a sniffed/reverse-DNS'd hostname into its canonical form:
    /// lowercase for DNS names, textual for IP literals.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Host::Ip(ip);
        }
        Host::Dns(trimmed.to_ascii_lowercase())
    }

    pub fn cache_key(&self) -> String {
        self.to_string()
    }

    pub(super) fn to_san_type(&self) -> Result<SanType, String> {
        match self {
            Host::Dns(name) => name
                .as_str()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|e| format!("invalid DNS name {name}: {e}")),
            Host::Ip(ip) => Ok(SanType::IpAddress(*ip)),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Dns(name) => write!(f, "{name}"),
            Host::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dns_name_lowercased() {
        assert_eq!(Host::parse("API.OpenAI.com"), Host::Dns("api.openai.com".to_string()));
    }

    #[test]
    fn parses_ipv4_literal() {
        assert_eq!(Host::parse("93.184.216.34"), Host::Ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn parses_ipv6_literal() {
        assert_eq!(Host::parse("::1"), Host::Ip("::1".parse().unwrap()));
    }
}
