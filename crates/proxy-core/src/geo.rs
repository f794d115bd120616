//! Geolocation gating (spec §4.5, §9 "Global shared state").
//!
//! The China-IP-range table and reserved-CIDR list are external
//! collaborators (spec §1); the core only consumes `is_china_ip(ip)` and
//! `reserved_cidrs()` through this narrow trait, injected at construction
//! time rather than reached for as mutable module statics.

use ipnet::IpNet;
use std::net::IpAddr;

/// Classifies IPs as domestic (China-allocated or reserved/private) vs.
/// foreign. Implementations are expected to be cheap and side-effect free.
pub trait GeoClassifier: Send + Sync {
    fn is_china_ip(&self, ip: IpAddr) -> bool;

    /// "Domestic" per the GLOSSARY: China-allocated *or* RFC1918/loopback/
    /// multicast-reserved.
    fn is_domestic(&self, ip: IpAddr) -> bool {
        self.is_china_ip(ip) || is_reserved(ip, &default_reserved_cidrs())
    }
}

/// Returns the standard reserved CIDR set: RFC1918 private ranges, loopback,
/// link-local, and multicast, for both IPv4 and IPv6.
pub fn default_reserved_cidrs() -> Vec<IpNet> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "224.0.0.0/4",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .iter()
    .map(|s| s.parse().expect("static CIDR literal"))
    .collect()
}

pub fn is_reserved(ip: IpAddr, cidrs: &[IpNet]) -> bool {
    cidrs.iter().any(|n| n.contains(&ip))
}

/// A classifier backed by an explicit, injected set of China-allocated
/// CIDRs (normally produced by fetching and parsing APNIC delegated-file
/// data, which is out of scope here).
pub struct StaticGeoClassifier {
    china_cidrs: Vec<IpNet>,
    reserved: Vec<IpNet>,
}

impl StaticGeoClassifier {
    pub fn new(china_cidrs: Vec<IpNet>) -> Self {
        Self {
            china_cidrs,
            reserved: default_reserved_cidrs(),
        }
    }
}

impl GeoClassifier for StaticGeoClassifier {
    fn is_china_ip(&self, ip: IpAddr) -> bool {
        self.china_cidrs.iter().any(|n| n.contains(&ip))
    }

    fn is_domestic(&self, ip: IpAddr) -> bool {
        self.is_china_ip(ip) || is_reserved(ip, &self.reserved)
    }
}
