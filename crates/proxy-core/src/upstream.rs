//! Upstream tunnel client: SOCKS5 (RFC 1928, no-auth), HTTP CONNECT, or
//! disabled (direct connect).

use crate::error::{CoreError, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub enum UpstreamClient {
    Disabled,
    Socks5 { addr: SocketAddr },
    HttpConnect { addr: SocketAddr },
}

impl UpstreamClient {
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        match self {
            UpstreamClient::Disabled => TcpStream::connect((host, port)).await.map_err(CoreError::Io),
            UpstreamClient::Socks5 { addr } => socks5_connect(*addr, host, port).await,
            UpstreamClient::HttpConnect { addr } => http_connect(*addr, host, port).await,
        }
    }
}

async fn socks5_connect(proxy_addr: SocketAddr, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    // Greeting: VER=5, NMETHODS=1, METHODS=[NO_AUTH].
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await?;
    if method_reply[0] != 0x05 || method_reply[1] != 0x00 {
        return Err(CoreError::UpstreamConnectError {
            kind: "socks5-method".to_string(),
            code: Some(method_reply[1]),
        });
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let (_ver, rep, _rsv, atyp) = (header[0], header[1], header[2], header[3]);

    let addr_len = match atyp {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            len_buf[0] as usize
        }
        other => {
            return Err(CoreError::UpstreamConnectError {
                kind: format!("socks5-unknown-atyp-{other}"),
                code: Some(rep),
            });
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    if rep != 0x00 {
        return Err(CoreError::UpstreamConnectError {
            kind: "socks5".to_string(),
            code: Some(rep),
        });
    }

    Ok(stream)
}

async fn http_connect(proxy_addr: SocketAddr, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            break;
        }
    }

    let status_line = buf
        .split(|&b| b == b'\n')
        .next()
        .ok_or_else(|| CoreError::UpstreamConnectError {
            kind: "http-connect-empty-response".to_string(),
            code: None,
        })?;
    let status_line = String::from_utf8_lossy(status_line);
    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if status_code != 200 {
        return Err(CoreError::UpstreamConnectError {
            kind: "http-connect".to_string(),
            code: Some((status_code / 100) as u8),
        });
    }

    Ok(stream)
}
