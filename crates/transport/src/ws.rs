use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::{Sink, Stream, pin_mut};
use tokio::io::{AsyncRead, AsyncWrite};

/// What the WebSocket implementation handed us when reading.
///
/// Both axum (server side) and tungstenite (client side) messages are mapped
/// into this enum so [`WsStream`] stays agnostic of the actual library.
#[derive(Debug)]
pub enum WsReadMsg {
    Payload(Bytes),
    /// Ping, pong: not part of the actual payload.
    Ignored,
    Close,
}

/// Exposes a WebSocket as a plain byte stream.
///
/// Binary and text frames carry payload bytes, a close frame maps to EOF.
pub struct WsStream<S> {
    inner: S,
    read_buf: Option<Bytes>,
}

impl<S> WsStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, read_buf: None }
    }
}

impl<S, E> AsyncRead for WsStream<S>
where
    S: Stream<Item = Result<WsReadMsg, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut data = if let Some(data) = self.read_buf.take() {
            data
        } else {
            loop {
                let inner = &mut self.inner;
                pin_mut!(inner);
                match ready!(inner.poll_next(cx)) {
                    Some(Ok(WsReadMsg::Payload(data))) => break data,
                    Some(Ok(WsReadMsg::Ignored)) => {}
                    // End reading on a close message.
                    Some(Ok(WsReadMsg::Close)) | None => return Poll::Ready(Ok(())),
                    Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                }
            }
        };

        let bytes_to_copy = core::cmp::min(buf.remaining(), data.len());

        buf.put_slice(&data[..bytes_to_copy]);

        if data.len() > bytes_to_copy {
            self.read_buf = Some(data.split_off(bytes_to_copy));
        }

        Poll::Ready(Ok(()))
    }
}

impl<S, E> AsyncWrite for WsStream<S>
where
    S: Sink<Bytes, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        // Try flushing preemptively, so items don’t pile up in the sink.
        let inner = &mut self.inner;
        pin_mut!(inner);
        let _ = inner.poll_flush(cx);

        // Make sure the sink is ready to accept a new item.
        let inner = &mut self.inner;
        pin_mut!(inner);
        if let Err(e) = ready!(inner.poll_ready(cx)) {
            return Poll::Ready(Err(io::Error::other(e)));
        }

        let inner = &mut self.inner;
        pin_mut!(inner);
        match inner.start_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.inner;
        pin_mut!(inner);
        match ready!(inner.poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.inner;
        pin_mut!(inner);
        match ready!(inner.poll_close(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    #[tokio::test]
    async fn payload_is_reassembled_across_reads() {
        let messages: Vec<Result<WsReadMsg, std::io::Error>> = vec![
            Ok(WsReadMsg::Payload(Bytes::from_static(b"hello "))),
            Ok(WsReadMsg::Ignored),
            Ok(WsReadMsg::Payload(Bytes::from_static(b"world"))),
            Ok(WsReadMsg::Close),
        ];
        let stream = futures_util::stream::iter(messages);
        let mut ws = WsStream::new(stream);

        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = AsyncReadExt::read(&mut ws, &mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }

        assert_eq!(out, b"hello world");
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<Bytes>,
    }

    impl Sink<Bytes> for RecordingSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
            self.sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn writes_forward_to_the_sink() {
        let mut ws = WsStream::new(RecordingSink::default());

        ws.write_all(b"ping").await.unwrap();
        ws.flush().await.unwrap();

        assert_eq!(ws.inner.sent, vec![Bytes::from_static(b"ping")]);
    }
}
