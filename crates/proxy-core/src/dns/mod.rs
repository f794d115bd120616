//! DNS splitter UDP listener (C5): accept queries, serve cache hits
//! directly, and hand misses to the race-and-select splitter under a
//! bounded concurrency gate.

mod cache;
mod splitter;

pub use cache::DnsCache;
pub use splitter::{DnsSplitter, DnsStats, DnsStatsSnapshot};

use crate::shutdown::{join_with_grace_period, ShutdownSignal};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Plain UDP DNS replies are limited to 512 bytes (RFC 1035 §4.2.1); anything
/// larger is replaced with a truncated stand-in so the client retries over
/// TCP.
const UDP_REPLY_LIMIT: usize = 512;

pub struct DnsServer {
    cache: Arc<DnsCache>,
    splitter: Arc<DnsSplitter>,
    concurrency: Arc<Semaphore>,
}

impl DnsServer {
    pub fn new(cache: Arc<DnsCache>, splitter: Arc<DnsSplitter>, max_concurrent_splits: usize) -> Self {
        Self {
            cache,
            splitter,
            concurrency: Arc::new(Semaphore::new(max_concurrent_splits.max(1))),
        }
    }

    /// Runs the UDP accept loop on `listen_addr` until `shutdown` fires, then
    /// stops accepting and gives in-flight query tasks the standard grace
    /// period (spec §5 "Cancellation") before returning.
    pub async fn run(self: Arc<Self>, listen_addr: SocketAddr, mut shutdown: ShutdownSignal) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(listen_addr).await?);
        let mut buf = vec![0u8; 4096];
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                recv = socket.recv_from(&mut buf) => {
                    let (n, peer) = recv?;
                    let query_bytes = buf[..n].to_vec();
                    let socket = socket.clone();
                    let this = self.clone();
                    tasks.spawn(async move {
                        this.handle_query(socket, peer, query_bytes).await;
                    });
                }
            }
        }
        join_with_grace_period(tasks).await;
        Ok(())
    }

    async fn handle_query(&self, socket: Arc<UdpSocket>, peer: SocketAddr, query_bytes: Vec<u8>) {
        let query = match Message::from_bytes(&query_bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping unparseable DNS query");
                return;
            }
        };
        let txid = query.id();
        let qname = query.queries().first().map(|q| q.name().to_string()).unwrap_or_default();
        let qtype: u16 = query.queries().first().map(|q| u16::from(q.query_type())).unwrap_or(0);

        let reply_bytes = if let Some(cached) = self.cache.get(&qname, qtype) {
            self.splitter.stats().hits.fetch_add(1, Ordering::Relaxed);
            Some(with_txid(cached, txid))
        } else {
            self.splitter.stats().misses.fetch_add(1, Ordering::Relaxed);
            let _permit = self.concurrency.acquire().await.expect("dns split semaphore never closes");
            match self.splitter.resolve(&query).await {
                Some((mut message, ttl)) => {
                    message.set_id(txid);
                    match message.to_bytes() {
                        Ok(bytes) => {
                            self.cache.insert(&qname, qtype, bytes.clone(), ttl);
                            Some(bytes)
                        }
                        Err(e) => {
                            warn!(qname, error = %e, "failed to serialize DNS reply");
                            Some(servfail_reply(&query))
                        }
                    }
                }
                None => Some(servfail_reply(&query)),
            }
        };

        if let Some(bytes) = reply_bytes {
            let bytes = truncate_for_udp(bytes, &query);
            if let Err(e) = socket.send_to(&bytes, peer).await {
                debug!(peer = %peer, error = %e, "failed to send DNS reply");
            }
        }
    }
}

/// Overwrites only the transaction-id field; every other byte of a cached or
/// freshly resolved reply is forwarded verbatim.
fn with_txid(mut bytes: Vec<u8>, txid: u16) -> Vec<u8> {
    if bytes.len() >= 2 {
        bytes[0..2].copy_from_slice(&txid.to_be_bytes());
    }
    bytes
}

fn servfail_reply(query: &Message) -> Vec<u8> {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_response_code(ResponseCode::ServFail);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response.to_bytes().unwrap_or_default()
}

fn truncate_for_udp(bytes: Vec<u8>, query: &Message) -> Vec<u8> {
    if bytes.len() <= UDP_REPLY_LIMIT {
        return bytes;
    }
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_truncated(true);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response.to_bytes().unwrap_or(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_txid_overwrites_only_the_first_two_bytes() {
        let original = vec![0xAA, 0xBB, 0x81, 0x80, 0x00, 0x01];
        let rewritten = with_txid(original.clone(), 0x1234);
        assert_eq!(&rewritten[0..2], &[0x12, 0x34]);
        assert_eq!(&rewritten[2..], &original[2..]);
    }

    #[test]
    fn truncate_for_udp_leaves_small_replies_untouched() {
        let query = Message::new();
        let small = vec![0u8; 100];
        assert_eq!(truncate_for_udp(small.clone(), &query), small);
    }
}
