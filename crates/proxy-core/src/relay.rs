//! Bidirectional byte relay between two already-connected streams.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayResult {
    pub upload: u64,
    pub download: u64,
}

/// Copies `client <-> origin` concurrently until both directions finish
/// (EOF or error), then shuts down the write half of whichever side hasn't
/// already half-closed. Byte counters are returned unconditionally, even if
/// one direction errored.
pub async fn relay<C, O>(mut client: C, mut origin: O) -> RelayResult
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(&mut client);
    let (mut origin_r, mut origin_w) = tokio::io::split(&mut origin);

    let c2o = async {
        let n = tokio::io::copy(&mut client_r, &mut origin_w).await.unwrap_or(0);
        let _ = origin_w.shutdown().await;
        n
    };
    let o2c = async {
        let n = tokio::io::copy(&mut origin_r, &mut client_w).await.unwrap_or(0);
        let _ = client_w.shutdown().await;
        n
    };

    let (upload, download) = tokio::join!(c2o, o2c);
    RelayResult { upload, download }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    #[tokio::test]
    async fn counts_bytes_in_both_directions() {
        let (client_side, mut client_peer) = duplex(1024);
        let (origin_side, mut origin_peer) = duplex(1024);

        let relay_task = tokio::spawn(relay(client_side, origin_side));

        client_peer.write_all(b"request-bytes").await.unwrap();
        let mut buf = vec![0u8; 13];
        origin_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request-bytes");

        origin_peer.write_all(b"response").await.unwrap();
        let mut buf2 = vec![0u8; 8];
        client_peer.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"response");

        drop(client_peer);
        drop(origin_peer);

        let result = relay_task.await.unwrap();
        assert_eq!(result.upload, 13);
        assert_eq!(result.download, 8);
    }
}
