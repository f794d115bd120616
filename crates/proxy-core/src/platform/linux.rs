//! Linux original-destination recovery via `SO_ORIGINAL_DST`.

use super::{OriginalDestination, PlatformCapability};
use crate::error::{CoreError, Result};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::AsRawFd;
use tokio::net::TcpStream;
use tracing::debug;

const SO_ORIGINAL_DST: libc::c_int = 80;
const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

pub struct LinuxCapability;

impl PlatformCapability for LinuxCapability {
    fn recover_dst(&self, conn: &TcpStream, connection_id: u64) -> Result<OriginalDestination> {
        let local = conn.local_addr().map_err(CoreError::Io)?;
        let fd = conn.as_raw_fd();

        let result = match local.ip() {
            IpAddr::V4(_) => recover_v4(fd),
            IpAddr::V6(_) => recover_v6(fd),
        };

        match result {
            Some(dst) if dst.ip != local.ip() || dst.port != local.port() => Ok(dst),
            _ => {
                debug!(connection_id, "no SO_ORIGINAL_DST (or identical to listener address)");
                Err(CoreError::NoOriginalDst { connection_id })
            }
        }
    }

    fn install_rules(&self, _redirect_ports: &[u16], _proxy_port: u16) -> Result<()> {
        // iptables/ipset rule installation is an external collaborator;
        // this capability only recovers destinations.
        Ok(())
    }

    fn remove_rules(&self) -> Result<()> {
        Ok(())
    }
}

fn recover_v4(fd: std::os::unix::io::RawFd) -> Option<OriginalDestination> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Some(OriginalDestination { ip: IpAddr::V4(ip), port })
}

fn recover_v6(fd: std::os::unix::io::RawFd) -> Option<OriginalDestination> {
    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IPV6,
            IP6T_SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
    let port = u16::from_be(addr.sin6_port);
    Some(OriginalDestination { ip: IpAddr::V6(ip), port })
}
