//! BSD/macOS original-destination recovery via `/dev/pf` `DIOCNATLOOK`
//! (spec §4.1). pf's NAT state table is queried directly; no kernel module
//! or iptables-equivalent exists on this platform, so `install_rules` only
//! documents that the redirect (`rdr` anchor) is an external collaborator.

use super::{OriginalDestination, PlatformCapability};
use crate::error::{CoreError, Result};
use std::fs::{File, OpenOptions};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;
use tokio::net::TcpStream;

const AF_INET: u8 = 2;
const AF_INET6: u8 = 30;
const PF_OUT: u8 = 2;

// Mirrors `struct pfioc_natlook` from <net/pfvar.h>. Layout matters: this is
// passed straight through the `DIOCNATLOOK` ioctl.
#[repr(C)]
#[derive(Clone, Copy)]
struct PfAddr {
    bytes: [u8; 16],
}

#[repr(C)]
struct PfiocNatlook {
    saddr: PfAddr,
    daddr: PfAddr,
    rsaddr: PfAddr,
    rdaddr: PfAddr,
    sport: u16,
    dport: u16,
    rsport: u16,
    rdport: u16,
    af: u8,
    proto: u8,
    proto_variant: u8,
    direction: u8,
}

// ioctl(2) request number for DIOCNATLOOK, computed the same way
// <sys/ioctl.h>'s _IOWR(d, '?', sz) macro does on the BSDs.
const IOC_INOUT: u64 = 0x4000_0000 | 0x8000_0000;
const IOC_DIRBITS: u64 = 13;
const DIOCNATLOOK_NUM: u64 = 23;

fn diocnatlook_ioctl() -> u64 {
    let size = mem::size_of::<PfiocNatlook>() as u64;
    IOC_INOUT | ((size & 0x1fff) << IOC_DIRBITS) | (('D' as u64) << 8) | DIOCNATLOOK_NUM
}

pub struct PfCapability {
    dev: Mutex<Option<File>>,
}

impl PfCapability {
    pub fn new() -> Self {
        Self { dev: Mutex::new(None) }
    }

    fn with_dev<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&File) -> std::io::Result<T>,
    {
        let mut guard = self.dev.lock().expect("pf device mutex poisoned");
        if guard.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/pf")
                .map_err(CoreError::Io)?;
            *guard = Some(file);
        }
        f(guard.as_ref().unwrap()).map_err(CoreError::Io)
    }
}

impl Default for PfCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformCapability for PfCapability {
    fn recover_dst(&self, conn: &TcpStream, connection_id: u64) -> Result<OriginalDestination> {
        let peer = conn.peer_addr().map_err(CoreError::Io)?;
        let local = conn.local_addr().map_err(CoreError::Io)?;

        let mut req: PfiocNatlook = unsafe { mem::zeroed() };
        req.af = if peer.is_ipv4() { AF_INET } else { AF_INET6 };
        req.proto = libc::IPPROTO_TCP as u8;
        req.direction = PF_OUT;
        req.sport = peer.port().to_be();
        req.dport = local.port().to_be();
        write_addr(&mut req.saddr, peer.ip());
        write_addr(&mut req.daddr, local.ip());

        let rc = self.with_dev(|file| {
            let ioc = diocnatlook_ioctl();
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), ioc as _, &mut req as *mut _ as *mut libc::c_void) };
            if ret != 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(())
            }
        });

        rc.map_err(|_| CoreError::NoOriginalDst { connection_id })?;

        let dst_ip = read_addr(&req.rdaddr, req.af);
        let dst_port = u16::from_be(req.rdport);

        if dst_ip.is_loopback() {
            return Err(CoreError::NoOriginalDst { connection_id });
        }

        Ok(OriginalDestination { ip: dst_ip, port: dst_port })
    }

    fn install_rules(&self, _redirect_ports: &[u16], _proxy_port: u16) -> Result<()> {
        // The `rdr-to` pf anchor that redirects traffic into the proxy is an
        // external collaborator (spec §1); this capability only resolves
        // destinations already captured by pf's state table.
        Ok(())
    }

    fn remove_rules(&self) -> Result<()> {
        Ok(())
    }
}

fn write_addr(slot: &mut PfAddr, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            slot.bytes[..4].copy_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            slot.bytes.copy_from_slice(&v6.octets());
        }
    }
}

fn read_addr(slot: &PfAddr, af: u8) -> IpAddr {
    if af == AF_INET {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&slot.bytes[..4]);
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        IpAddr::V6(Ipv6Addr::from(slot.bytes))
    }
}
