use anyhow::{Context as _, Result};
use tokio::io::{AsyncRead, AsyncWrite};

pub struct BidirForwardResult {
    pub nb_a_to_b: u64,
    pub nb_b_to_a: u64,
}

/// Splices two byte streams together until both directions are done.
///
/// EOF on one side half-closes the other side’s write direction; byte order
/// is preserved within each direction.
pub async fn forward_bidirectional<A, B>(mut a: A, mut b: B) -> Result<BidirForwardResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (nb_a_to_b, nb_b_to_a) = tokio::io::copy_bidirectional(&mut a, &mut b)
        .await
        .context("copy_bidirectional operation")?;

    Ok(BidirForwardResult { nb_a_to_b, nb_b_to_a })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn bytes_cross_in_both_directions() {
        let (client, proxy_side_a) = tokio::io::duplex(64);
        let (server, proxy_side_b) = tokio::io::duplex(64);

        let forwarder = tokio::spawn(forward_bidirectional(proxy_side_a, proxy_side_b));

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut server_rd, mut server_wr) = tokio::io::split(server);

        client_wr.write_all(b"request").await.unwrap();
        client_wr.shutdown().await.unwrap();

        let mut seen = vec![0u8; 7];
        server_rd.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"request");

        server_wr.write_all(b"response").await.unwrap();
        server_wr.shutdown().await.unwrap();

        let mut out = Vec::new();
        client_rd.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"response");

        let result = forwarder.await.unwrap().unwrap();
        assert_eq!(result.nb_a_to_b, 7);
        assert_eq!(result.nb_b_to_a, 8);
    }
}
