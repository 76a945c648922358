//! Bidirectional byte bridge between two streams

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reader that counts the bytes passing through it
struct Counted<R> {
    inner: R,
    bytes: u64,
}

impl<R: AsyncRead + Unpin> AsyncRead for Counted<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.bytes += (buf.filled().len() - before) as u64;
        Poll::Ready(Ok(()))
    }
}

/// Splice `a` and `b` together until either side ends
///
/// Each direction is one copy. When a direction sees EOF or an error it
/// shuts down its destination and stops the opposite direction, which then
/// shuts down its own destination. Returns once both directions are done,
/// dropping (and so fully closing) both endpoints.
///
/// Returns the number of bytes moved `(a -> b, b -> a)`.
pub async fn bridge<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (a_read, mut a_write) = tokio::io::split(a);
    let (b_read, mut b_write) = tokio::io::split(b);
    let done = CancellationToken::new();

    let a_to_b = forward(a_read, &mut b_write, &done, "a->b");
    let b_to_a = forward(b_read, &mut a_write, &done, "b->a");

    tokio::join!(a_to_b, b_to_a)
}

async fn forward<R, W>(
    reader: R,
    writer: &mut W,
    done: &CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = Counted {
        inner: reader,
        bytes: 0,
    };

    tokio::select! {
        result = tokio::io::copy(&mut reader, writer) => {
            if let Err(e) = result {
                debug!(direction, error = %e, "Bridge direction ended with error");
            }
        }
        _ = done.cancelled() => {}
    }

    let _ = writer.shutdown().await;
    done.cancel();

    reader.bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bridge_moves_bytes_both_ways() {
        let (mut client, a) = tokio::io::duplex(1024);
        let (b, mut server) = tokio::io::duplex(1024);

        let handle = tokio::spawn(bridge(a, b));

        client.write_all(b"hello server").await.unwrap();
        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello server");

        server.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        client.shutdown().await.unwrap();

        // Server sees EOF, then the whole bridge comes down
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let (a_to_b, b_to_a) = handle.await.unwrap();
        assert_eq!(a_to_b, 12);
        assert_eq!(b_to_a, 2);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_one_side_closing_tears_down_both() {
        let (client, a) = tokio::io::duplex(1024);
        let (b, mut server) = tokio::io::duplex(1024);

        let handle = tokio::spawn(bridge(a, b));

        drop(client);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        assert_eq!(handle.await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_large_transfer() {
        let (mut client, a) = tokio::io::duplex(8 * 1024);
        let (b, mut server) = tokio::io::duplex(8 * 1024);
        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 199) as u8).collect();

        let handle = tokio::spawn(bridge(a, b));

        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        });

        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(reader.await.unwrap(), expected);
        let (a_to_b, _) = handle.await.unwrap();
        assert_eq!(a_to_b, expected.len() as u64);
    }
}
