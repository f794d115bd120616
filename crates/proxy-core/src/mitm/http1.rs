//! HTTP/1.1 request/response capture loop.
//!
//! Bodies are never buffered whole: the framing (`Content-Length`,
//! `Transfer-Encoding: chunked`, or close-delimited) is parsed from the head
//! only, and the body is streamed chunk-by-chunk while a bounded preview is
//! retained for the published `InspectionEvent`.

use crate::error::{CoreError, Result};
use crate::events::{Direction, EventBus, InspectionEvent};
use crate::relay::RelayResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_SIZE: usize = 64 * 1024;

struct Head {
    raw: Vec<u8>,
    headers: Vec<(String, String)>,
    method: Option<String>,
    path: Option<String>,
    status: Option<u16>,
}

enum Framing {
    ContentLength(u64),
    Chunked,
    Closed,
    None,
}

/// Runs the request/response capture loop until the connection closes.
/// Request order is preserved by construction: one request is fully
/// forwarded (head + body) before its response is read, matching the
/// "do not pipeline" rule.
pub async fn run<C, O>(
    mut client: C,
    mut origin: O,
    events: &EventBus,
    max_body_size: usize,
    host: String,
    connection_id: u64,
) -> Result<RelayResult>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let mut upload = 0u64;
    let mut download = 0u64;

    loop {
        let Some(req_head) = read_head(&mut client, &mut upload, connection_id).await? else {
            break;
        };
        origin.write_all(&req_head.raw).await.map_err(CoreError::Io)?;

        let expects_continue = req_head
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("expect") && v.eq_ignore_ascii_case("100-continue"));

        let req_framing = framing_of(&req_head.headers, true);
        let mut close_after = connection_should_close(&req_head.headers);

        if expects_continue {
            // Peek the origin's interim response before sending the body, per
            // RFC 7231 §5.1.1. A non-100 status here means the origin already
            // decided the final outcome without needing the request body.
            let interim = read_head(&mut origin, &mut download, connection_id).await?;
            match interim {
                Some(h) if h.status == Some(100) => {
                    client.write_all(&h.raw).await.map_err(CoreError::Io)?;
                    let mut req_body = BodyCapture::new(max_body_size);
                    forward_body(&mut client, &mut origin, req_framing, &mut upload, connection_id, &mut req_body).await?;
                    publish_request_event(events, &req_head, &host, req_body);
                    let resp_head = read_head_required(&mut origin, &mut download, connection_id).await?;
                    client.write_all(&resp_head.raw).await.map_err(CoreError::Io)?;
                    close_after |= connection_should_close(&resp_head.headers);
                    let resp_framing = framing_of(&resp_head.headers, false);
                    let mut resp_body = BodyCapture::new(max_body_size);
                    forward_body(&mut origin, &mut client, resp_framing, &mut download, connection_id, &mut resp_body).await?;
                    publish_response_event(events, &resp_head, &host, resp_body);
                }
                Some(h) => {
                    // Final response without a 100 Continue; forward as-is
                    // and skip sending the request body.
                    publish_request_event(events, &req_head, &host, BodyCapture::new(max_body_size));
                    client.write_all(&h.raw).await.map_err(CoreError::Io)?;
                    close_after |= connection_should_close(&h.headers);
                    let resp_framing = framing_of(&h.headers, false);
                    let mut resp_body = BodyCapture::new(max_body_size);
                    forward_body(&mut origin, &mut client, resp_framing, &mut download, connection_id, &mut resp_body).await?;
                    publish_response_event(events, &h, &host, resp_body);
                }
                None => break,
            }
        } else {
            let mut req_body = BodyCapture::new(max_body_size);
            forward_body(&mut client, &mut origin, req_framing, &mut upload, connection_id, &mut req_body).await?;
            publish_request_event(events, &req_head, &host, req_body);

            let Some(resp_head) = read_head(&mut origin, &mut download, connection_id).await? else {
                break;
            };
            client.write_all(&resp_head.raw).await.map_err(CoreError::Io)?;
            close_after |= connection_should_close(&resp_head.headers);
            let resp_framing = framing_of(&resp_head.headers, false);
            let mut resp_body = BodyCapture::new(max_body_size);
            forward_body(&mut origin, &mut client, resp_framing, &mut download, connection_id, &mut resp_body).await?;
            publish_response_event(events, &resp_head, &host, resp_body);
        }

        if close_after {
            break;
        }
    }

    let _ = client.shutdown().await;
    let _ = origin.shutdown().await;
    Ok(RelayResult { upload, download })
}

fn connection_should_close(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"))
}

/// Reads one HTTP head (request or response) into a raw byte buffer, parsing
/// just enough to return headers and (for requests) method/path or (for
/// responses) status. Returns `Ok(None)` on a clean EOF with no bytes read.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S, counter: &mut u64, connection_id: u64) -> Result<Option<Head>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await.map_err(CoreError::Io)?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(CoreError::RelayClosed("connection closed mid-head".to_string()))
            };
        }
        *counter += n as u64;
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head) = try_parse_head(&buf)? {
            return Ok(Some(head));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(CoreError::SnifferProtocolError {
                connection_id,
                reason: "HTTP head exceeded maximum size".to_string(),
            });
        }
    }
}

async fn read_head_required<S: AsyncRead + Unpin>(stream: &mut S, counter: &mut u64, connection_id: u64) -> Result<Head> {
    read_head(stream, counter, connection_id)
        .await?
        .ok_or_else(|| CoreError::RelayClosed("origin closed before sending a response head".to_string()))
}

fn try_parse_head(buf: &[u8]) -> Result<Option<Head>> {
    let terminator = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let Some(pos) = terminator else {
        return Ok(None);
    };
    let head_end = pos + 4;
    let raw = buf[..head_end].to_vec();

    // Disambiguate request vs response by the first byte of the status
    // line / request line: responses start with "HTTP/".
    if raw.starts_with(b"HTTP/") {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(&raw) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return Ok(None),
        }
        let parsed_headers = collect_headers(resp.headers);
        Ok(Some(Head {
            raw,
            headers: parsed_headers,
            method: None,
            path: None,
            status: resp.code,
        }))
    } else {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&raw) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return Ok(None),
        }
        let parsed_headers = collect_headers(req.headers);
        Ok(Some(Head {
            raw,
            headers: parsed_headers,
            method: req.method.map(|m| m.to_string()),
            path: req.path.map(|p| p.to_string()),
            status: None,
        }))
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    raw.iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect()
}

fn framing_of(headers: &[(String, String)], is_request: bool) -> Framing {
    if headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"))
    {
        return Framing::Chunked;
    }
    if let Some((_, v)) = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
        if let Ok(len) = v.trim().parse::<u64>() {
            return Framing::ContentLength(len);
        }
    }
    if is_request {
        Framing::None
    } else {
        Framing::Closed
    }
}

/// Accumulates up to `limit` bytes of a streamed body for an
/// `InspectionEvent`'s `body_preview`: a prefix is kept and `truncated` is
/// set once more bytes than `limit` have passed through, but every byte is
/// still forwarded downstream.
struct BodyCapture {
    preview: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BodyCapture {
    fn new(limit: usize) -> Self {
        Self { preview: Vec::new(), limit, truncated: false }
    }

    fn observe(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.preview.len());
        let take = room.min(chunk.len());
        self.preview.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            self.truncated = true;
        }
    }
}

/// Streams a body from `src` to `dst` per `framing`, capturing up to
/// `capture.limit` bytes for the inspection event without ever holding the
/// whole body in memory.
async fn forward_body<R, W>(
    src: &mut R,
    dst: &mut W,
    framing: Framing,
    counter: &mut u64,
    connection_id: u64,
    capture: &mut BodyCapture,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        Framing::None => Ok(()),
        Framing::ContentLength(len) => forward_exact(src, dst, len, counter, capture).await,
        Framing::Chunked => forward_chunked(src, dst, counter, connection_id, capture).await,
        Framing::Closed => forward_until_eof(src, dst, counter, capture).await,
    }
}

async fn forward_exact<R, W>(
    src: &mut R,
    dst: &mut W,
    mut remaining: u64,
    counter: &mut u64,
    capture: &mut BodyCapture,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if remaining > capture.limit as u64 {
        capture.truncated = true;
    }
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = src.read(&mut buf[..want]).await.map_err(CoreError::Io)?;
        if n == 0 {
            return Err(CoreError::RelayClosed("connection closed mid-body".to_string()));
        }
        dst.write_all(&buf[..n]).await.map_err(CoreError::Io)?;
        capture.observe(&buf[..n]);
        *counter += n as u64;
        remaining -= n as u64;
    }
    Ok(())
}

async fn forward_until_eof<R, W>(src: &mut R, dst: &mut W, counter: &mut u64, capture: &mut BodyCapture) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = src.read(&mut buf).await.map_err(CoreError::Io)?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await.map_err(CoreError::Io)?;
        capture.observe(&buf[..n]);
        *counter += n as u64;
    }
}

/// Forwards a chunked-encoding body verbatim (chunk-size lines, chunk data,
/// and the trailing headers block), parsing only enough to find the
/// terminating zero-length chunk.
async fn forward_chunked<R, W>(
    src: &mut R,
    dst: &mut W,
    counter: &mut u64,
    connection_id: u64,
    capture: &mut BodyCapture,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size_line = read_line(src, counter, connection_id).await?;
        dst.write_all(&size_line).await.map_err(CoreError::Io)?;

        let line_str = String::from_utf8_lossy(&size_line);
        let size_str = line_str.trim().split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_str, 16).map_err(|_| CoreError::SnifferProtocolError {
            connection_id,
            reason: format!("invalid chunk size line: {line_str:?}"),
        })?;

        if size == 0 {
            // Trailer headers (possibly empty) followed by a final CRLF.
            loop {
                let trailer_line = read_line(src, counter, connection_id).await?;
                dst.write_all(&trailer_line).await.map_err(CoreError::Io)?;
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            return Ok(());
        }

        forward_exact(src, dst, size, counter, capture).await?;
        let crlf = read_line(src, counter, connection_id).await?;
        dst.write_all(&crlf).await.map_err(CoreError::Io)?;
    }
}

async fn read_line<R: AsyncRead + Unpin>(src: &mut R, counter: &mut u64, connection_id: u64) -> Result<Vec<u8>> {
    let mut line = Vec::with_capacity(32);
    let mut byte = [0u8; 1];
    loop {
        let n = src.read(&mut byte).await.map_err(CoreError::Io)?;
        if n == 0 {
            return Err(CoreError::RelayClosed("connection closed mid-chunk-header".to_string()));
        }
        *counter += 1;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            return Ok(line);
        }
        if line.len() > 4096 {
            return Err(CoreError::SnifferProtocolError {
                connection_id,
                reason: "chunk header line too long".to_string(),
            });
        }
    }
}

fn publish_request_event(events: &EventBus, head: &Head, host: &str, body: BodyCapture) {
    let mut event = InspectionEvent::new(Direction::Request, host);
    event.method = head.method.clone();
    event.url = head.path.clone();
    event.headers = head.headers.clone();
    event.body_preview = body.preview;
    event.truncated = body.truncated;
    events.publish(event);
}

fn publish_response_event(events: &EventBus, head: &Head, host: &str, body: BodyCapture) {
    let mut event = InspectionEvent::new(Direction::Response, host);
    event.status = head.status;
    event.headers = head.headers.clone();
    event.body_preview = body.preview;
    event.truncated = body.truncated;
    events.publish(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tokio::io::duplex;

    #[tokio::test]
    async fn forwards_a_simple_get_request_and_response() {
        let (client_side, mut client_peer) = duplex(8192);
        let (origin_side, mut origin_peer) = duplex(8192);
        let events = EventBus::new(10);

        let session = tokio::spawn(async move {
            run(client_side, origin_side, &events, 1024, "example.com".to_string(), 1).await
        });

        client_peer
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut received = vec![0u8; 4096];
        let n = origin_peer.read(&mut received).await.unwrap();
        assert!(String::from_utf8_lossy(&received[..n]).starts_with("GET / HTTP/1.1"));

        origin_peer
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        drop(origin_peer);

        let mut got = vec![0u8; 4096];
        let n = client_peer.read(&mut got).await.unwrap();
        assert!(String::from_utf8_lossy(&got[..n]).ends_with("hello"));

        let result = session.await.unwrap().unwrap();
        assert!(result.upload > 0);
        assert!(result.download > 0);
    }

    #[tokio::test]
    async fn forwards_a_chunked_response_body() {
        let (client_side, mut client_peer) = duplex(8192);
        let (origin_side, mut origin_peer) = duplex(8192);
        let events = EventBus::new(10);

        let session = tokio::spawn(async move {
            run(client_side, origin_side, &events, 1024, "example.com".to_string(), 1).await
        });

        client_peer
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut req_buf = vec![0u8; 4096];
        origin_peer.read(&mut req_buf).await.unwrap();

        origin_peer
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n4\r\nwiki\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        drop(origin_peer);

        let mut got = Vec::new();
        loop {
            let mut buf = [0u8; 256];
            let n = client_peer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&got);
        assert!(text.contains("wiki"));
        assert!(text.contains("0\r\n\r\n"));

        session.await.unwrap().unwrap();
    }

    #[test]
    fn body_capture_truncates_at_exactly_one_byte_over_the_limit() {
        let mut capture = BodyCapture::new(4);
        capture.observe(b"abcde");
        assert_eq!(capture.preview, b"abcd");
        assert!(capture.truncated);
    }

    #[test]
    fn body_capture_does_not_truncate_when_body_fits_exactly() {
        let mut capture = BodyCapture::new(4);
        capture.observe(b"abcd");
        assert_eq!(capture.preview, b"abcd");
        assert!(!capture.truncated);
    }

    #[tokio::test]
    async fn request_event_carries_a_body_preview() {
        let (client_side, mut client_peer) = duplex(8192);
        let (origin_side, mut origin_peer) = duplex(8192);
        let events = EventBus::new(10);
        let mut sub = events.subscribe();

        let session = tokio::spawn(async move {
            run(client_side, origin_side, &events, 3, "example.com".to_string(), 1).await
        });

        client_peer
            .write_all(b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();

        let mut req_buf = vec![0u8; 4096];
        origin_peer.read(&mut req_buf).await.unwrap();
        origin_peer
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        drop(origin_peer);

        let mut client_buf = vec![0u8; 4096];
        let _ = client_peer.read(&mut client_buf).await;

        let request_event = sub.recv().await.unwrap();
        assert_eq!(request_event.method.as_deref(), Some("POST"));
        assert_eq!(request_event.url.as_deref(), Some("/submit"));
        assert_eq!(request_event.body_preview, b"hel");
        assert!(request_event.truncated);

        session.await.unwrap().unwrap();
    }
}
