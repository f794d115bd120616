//! SNI (TLS ClientHello) and `Host:` header sniffing.

use crate::error::{CoreError, Result};

/// Extract the SNI hostname from a buffer that is expected to start with a
/// TLS record of type `handshake` (0x16) containing a `ClientHello`.
/// Returns the lowercased hostname. Any structural problem is reported as
/// `SnifferProtocolError` so the caller can fall back to an IP identifier.
pub fn sniff_sni(buf: &[u8], connection_id: u64) -> Result<String> {
    let err = |reason: &str| CoreError::SnifferProtocolError {
        connection_id,
        reason: reason.to_string(),
    };

    if buf.len() < 5 {
        return Err(err("buffer too short for a TLS record header"));
    }
    if buf[0] != 0x16 {
        return Err(err("not a TLS handshake record"));
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let record_end = 5 + record_len;
    if buf.len() < record_end.min(buf.len()) {
        // Record is larger than what we peeked; still try to parse what we
        // have, since the ClientHello header (and SNI, which comes early)
        // usually arrives in the first segment.
    }
    let body = &buf[5..buf.len().min(record_end)];
    if body.len() < 4 {
        return Err(err("handshake message too short"));
    }
    if body[0] != 0x01 {
        return Err(err("not a ClientHello"));
    }

    let mut pos = 4; // skip handshake msg_type(1) + length(3)
    if body.len() < pos + 2 + 32 {
        return Err(err("truncated ClientHello: version/random"));
    }
    pos += 2 + 32; // client_version(2) + random(32)

    let session_id_len = *body.get(pos).ok_or_else(|| err("truncated session id"))? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = read_u16(body, pos, &err)? as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *body.get(pos).ok_or_else(|| err("truncated compression methods"))? as usize;
    pos += 1 + compression_len;

    if pos + 2 > body.len() {
        // No extensions present, hence no SNI.
        return Err(err("no extensions / no SNI"));
    }
    let extensions_len = read_u16(body, pos, &err)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(body.len());

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(body, pos, &err)?;
        let ext_len = read_u16(body, pos + 2, &err)? as usize;
        let ext_start = pos + 4;
        let ext_end = (ext_start + ext_len).min(body.len());
        if ext_type == 0x0000 {
            return parse_server_name_extension(&body[ext_start..ext_end], &err);
        }
        pos = ext_end;
    }

    Err(err("no server_name extension present"))
}

fn parse_server_name_extension(ext: &[u8], err: &impl Fn(&str) -> CoreError) -> Result<String> {
    if ext.len() < 2 {
        return Err(err("truncated server_name list"));
    }
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    let list = &ext[2..ext.len().min(2 + list_len)];
    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = u16::from_be_bytes([list[pos + 1], list[pos + 2]]) as usize;
        let name_start = pos + 3;
        let name_end = (name_start + name_len).min(list.len());
        if name_type == 0x00 {
            let name = std::str::from_utf8(&list[name_start..name_end])
                .map_err(|_| err("server name is not valid utf-8"))?;
            return Ok(name.to_ascii_lowercase());
        }
        pos = name_end;
    }
    Err(err("server_name list had no hostname entry"))
}

fn read_u16(buf: &[u8], pos: usize, err: &impl Fn(&str) -> CoreError) -> Result<u16> {
    if pos + 2 > buf.len() {
        return Err(err("truncated length field"));
    }
    Ok(u16::from_be_bytes([buf[pos], buf[pos + 1]]))
}

/// Extract and canonicalize the `Host:` header from a buffer expected to
/// contain the start of an HTTP/1.x request.
pub fn sniff_host(buf: &[u8], connection_id: u64) -> Result<String> {
    let err = |reason: &str| CoreError::SnifferProtocolError {
        connection_id,
        reason: reason.to_string(),
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) | Ok(httparse::Status::Partial) => {}
        Err(e) => return Err(err(&format!("malformed request line/headers: {e}"))),
    }

    let host_header = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .ok_or_else(|| err("no Host header"))?;
    let raw = std::str::from_utf8(host_header.value)
        .map_err(|_| err("Host header is not valid utf-8"))?
        .trim();

    Ok(canonicalize_host(raw))
}

/// Strips a trailing `:port` suffix (only when all-digit and <= 5 chars) and
/// lowercases the result. Handles bracketed IPv6 literals (`[::1]:8080`).
fn canonicalize_host(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            // Bracketed IPv6 literal; only strip a port after the bracket.
            let host = &rest[..end];
            return format!("[{}]", host.to_ascii_lowercase());
        }
    }
    if let Some(idx) = raw.rfind(':') {
        let (host, port) = raw.split_at(idx);
        let port = &port[1..];
        if !port.is_empty() && port.len() <= 5 && port.bytes().all(|b| b.is_ascii_digit()) {
            return host.to_ascii_lowercase();
        }
    }
    raw.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_plain_host_with_port() {
        assert_eq!(canonicalize_host("Example.COM:8080"), "example.com");
    }

    #[test]
    fn canonicalizes_host_without_port() {
        assert_eq!(canonicalize_host("Example.COM"), "example.com");
    }

    #[test]
    fn keeps_port_suffix_if_not_all_digits() {
        assert_eq!(canonicalize_host("example.com:abc"), "example.com:abc");
    }

    #[test]
    fn handles_bracketed_ipv6_literal() {
        assert_eq!(canonicalize_host("[::1]:8443"), "[::1]");
    }

    #[test]
    fn sniff_host_strips_whitespace_and_case() {
        let req = b"GET / HTTP/1.1\r\nHost:   Example.COM:80  \r\n\r\n";
        let host = sniff_host(req, 1).unwrap();
        assert_eq!(host, "example.com");
    }

    #[test]
    fn sniff_sni_finds_hostname_in_minimal_client_hello() {
        let hello = build_client_hello_with_sni("api.openai.com");
        let host = sniff_sni(&hello, 1).unwrap();
        assert_eq!(host, "api.openai.com");
    }

    #[test]
    fn sniff_sni_errors_on_non_handshake_record() {
        let buf = [0x17, 0x03, 0x03, 0x00, 0x01, 0xAA];
        assert!(sniff_sni(&buf, 1).is_err());
    }

    /// Builds a syntactically minimal TLS 1.2 ClientHello record carrying a
    /// single SNI hostname, enough to exercise the parser above.
    fn build_client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let mut server_name = vec![0x00]; // name_type = host_name
        server_name.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        server_name.extend_from_slice(hostname.as_bytes());

        let mut server_name_list = (server_name.len() as u16).to_be_bytes().to_vec();
        server_name_list.extend_from_slice(&server_name);

        let mut sni_ext = vec![0x00, 0x00]; // extension type = server_name
        sni_ext.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&server_name_list);

        let mut extensions = sni_ext;
        let extensions_len = extensions.len() as u16;

        let mut body = vec![0x03, 0x03]; // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id_len
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites_len
        body.extend_from_slice(&[0x00, 0x2f]); // one cipher suite
        body.push(1); // compression_methods_len
        body.push(0); // null compression
        body.extend_from_slice(&extensions_len.to_be_bytes());
        body.append(&mut extensions);

        let mut handshake = vec![0x01]; // ClientHello
        let body_len = (body.len() as u32).to_be_bytes();
        handshake.extend_from_slice(&body_len[1..]); // 3-byte length
        handshake.append(&mut body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.append(&mut handshake);
        record
    }
}
