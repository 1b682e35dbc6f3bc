use std::io;

use bytes::{Buf as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Frame, Header, MAXIMUM_PAYLOAD_SIZE};

pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        const MAX_RESERVE_CHUNK: usize = 8 * 1024; // 8 kiB

        if src.len() < Header::SIZE {
            // Not enough data to read the header.
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[4..8]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAXIMUM_PAYLOAD_SIZE {
            return Err(io::Error::other(crate::Error::PayloadOversized {
                payload_size: length,
                max: MAXIMUM_PAYLOAD_SIZE,
            }));
        }

        let frame_size = Header::SIZE + length;

        if src.len() < frame_size {
            // The full frame has not arrived yet.
            // Reserve more space in the buffer (good performance-wise).
            let additional = core::cmp::min(MAX_RESERVE_CHUNK, frame_size - src.len());
            src.reserve(additional);

            // Inform the Framed that more bytes are required to form the next frame.
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(frame_size).freeze();
        let channel = crate::ChannelId::from(frame_bytes.get_u32());
        frame_bytes.advance(4);

        Ok(Some(Frame {
            channel,
            payload: frame_bytes,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt as _;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio_util::codec::FramedRead;

    /// Delivers its bytes one at a time, to exercise frame reassembly.
    struct TricklingReader {
        raw: Vec<u8>,
    }

    impl AsyncRead for TricklingReader {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if self.raw.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let byte = self.raw.remove(0);
            buf.put_slice(&[byte]);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn frames_are_reassembled_from_partial_reads() {
        let first = Frame::data(crate::ChannelId::from(1), Bytes::from_static(b"hello"));
        let second = Frame::data(crate::ChannelId::from(2), Bytes::from_static(b"!"));

        let mut raw = BytesMut::new();
        first.encode(&mut raw).unwrap();
        second.encode(&mut raw).unwrap();

        let reader = TricklingReader { raw: raw.to_vec() };
        let mut framed = FramedRead::new(reader, FrameCodec);

        assert_eq!(framed.next().await.unwrap().unwrap(), first);
        assert_eq!(framed.next().await.unwrap().unwrap(), second);
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_a_decode_error() {
        let mut raw = vec![0, 0, 0, 1];
        raw.extend_from_slice(&(u32::try_from(MAXIMUM_PAYLOAD_SIZE + 1).unwrap()).to_be_bytes());

        let reader = TricklingReader { raw };
        let mut framed = FramedRead::new(reader, FrameCodec);

        assert!(framed.next().await.unwrap().is_err());
    }
}
