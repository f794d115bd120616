//! Platform capability interface. Firewall rule management and
//! original-destination recovery differ per OS; this is a narrow trait with
//! one implementation per platform, so the dispatcher (and its tests) only
//! ever depend on the trait.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
mod pf;

use crate::error::{CoreError, Result};
use std::net::IpAddr;
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalDestination {
    pub ip: IpAddr,
    pub port: u16,
}

/// Capability seam for firewall rule management and original-destination
/// recovery. The dispatcher only ever calls `recover_dst`; the other two
/// methods exist so platform rule installation has a single interface
/// instead of being scattered `cfg`-conditional code.
pub trait PlatformCapability: Send + Sync {
    fn recover_dst(&self, conn: &TcpStream, connection_id: u64) -> Result<OriginalDestination>;

    fn install_rules(&self, redirect_ports: &[u16], proxy_port: u16) -> Result<()>;

    fn remove_rules(&self) -> Result<()>;
}

#[cfg(target_os = "linux")]
pub fn default_capability() -> Box<dyn PlatformCapability> {
    Box::new(linux::LinuxCapability)
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
pub fn default_capability() -> Box<dyn PlatformCapability> {
    Box::new(pf::PfCapability::new())
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
pub fn default_capability() -> Box<dyn PlatformCapability> {
    Box::new(SimulatedCapability::always_fail())
}

/// A test double used by unit/integration tests and by unsupported
/// platforms: never touches the kernel, returns a fixed mapping (or always
/// fails) so C4 can be exercised end-to-end without a real redirect.
pub struct SimulatedCapability {
    fixed: Option<OriginalDestination>,
}

impl SimulatedCapability {
    pub fn with_fixed_destination(dst: OriginalDestination) -> Self {
        Self { fixed: Some(dst) }
    }

    pub fn always_fail() -> Self {
        Self { fixed: None }
    }
}

impl PlatformCapability for SimulatedCapability {
    fn recover_dst(&self, _conn: &TcpStream, connection_id: u64) -> Result<OriginalDestination> {
        self.fixed.ok_or(CoreError::NoOriginalDst { connection_id })
    }

    fn install_rules(&self, _redirect_ports: &[u16], _proxy_port: u16) -> Result<()> {
        Ok(())
    }

    fn remove_rules(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_capability_returns_fixed_destination() {
        let cap = SimulatedCapability::with_fixed_destination(OriginalDestination {
            ip: "93.184.216.34".parse().unwrap(),
            port: 80,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let accept = listener.accept();
        let (conn, _accepted) = tokio::join!(connect, accept);
        let conn = conn.unwrap();

        let dst = cap.recover_dst(&conn, 1).unwrap();
        assert_eq!(dst.port, 80);
    }

    #[tokio::test]
    async fn simulated_capability_always_fail_reports_no_original_dst() {
        let cap = SimulatedCapability::always_fail();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let accept = listener.accept();
        let (conn, _accepted) = tokio::join!(connect, accept);
        let conn = conn.unwrap();

        let err = cap.recover_dst(&conn, 7).unwrap_err();
        assert!(matches!(err, CoreError::NoOriginalDst { connection_id: 7 }));
    }
}
