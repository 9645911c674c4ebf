//! Message encoding/decoding over a byte stream
//!
//! Message format:
//! ```text
//! +--------+--------+--------+--------+
//! |  Magic (0xFFFF) |  Length (2B BE) |
//! +--------+--------+--------+--------+
//! |         Payload (Length)          |
//! +--------+--------+--------+--------+
//! ```

use crate::protocol::{ProtocolError, HEADER_SIZE, MAGIC, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::transport::ConnectionError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame size limits plus the codec built on them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framer {
    min_size: usize,
    max_size: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(MIN_FRAME_SIZE, MAX_FRAME_SIZE)
    }
}

impl Framer {
    /// Create a framer accepting payloads in `[min_size, max_size]`.
    ///
    /// `max_size` is capped at what the 16-bit length field can carry.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        let max_size = max_size.min(u16::MAX as usize);
        Self {
            min_size: min_size.min(max_size),
            max_size,
        }
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Validate a payload length against the configured bounds
    pub fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size < self.min_size || size > self.max_size {
            return Err(ProtocolError::BadSize {
                size,
                min: self.min_size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Encode one frame into a complete message
    pub fn encode(&self, frame: &[u8]) -> Result<BytesMut, ProtocolError> {
        self.check_size(frame.len())?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(frame.len() as u16);
        buf.put_slice(frame);
        Ok(buf)
    }

    /// Validate a message header and return the payload length it declares
    pub fn decode_header(&self, header: &[u8; HEADER_SIZE]) -> Result<usize, ProtocolError> {
        if header[0..2] != MAGIC {
            return Err(ProtocolError::BadMagic([header[0], header[1]]));
        }

        let size = u16::from_be_bytes([header[2], header[3]]) as usize;
        self.check_size(size)?;
        Ok(size)
    }

    /// Read exactly one message from `reader` and return its payload
    pub async fn read_message<R>(&self, reader: &mut R) -> crate::Result<Bytes>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_SIZE];
        read_full(reader, &mut header).await?;
        let size = self.decode_header(&header)?;

        let mut payload = BytesMut::zeroed(size);
        read_full(reader, &mut payload).await?;
        Ok(payload.freeze())
    }

    /// Encode `frame` and write the whole message to `writer`
    pub async fn write_message<W>(&self, writer: &mut W, frame: &[u8]) -> crate::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let message = self.encode(frame)?;
        write_full(writer, &message).await?;
        Ok(())
    }
}

/// Fill `buf` completely, retrying short reads.
///
/// A zero-length read means the peer closed the stream, possibly in the
/// middle of a message.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
        filled += n;
    }
    Ok(())
}

/// Write all of `buf`, retrying short writes, then flush
pub async fn write_full<W>(writer: &mut W, buf: &[u8]) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < buf.len() {
        let n = writer
            .write(&buf[written..])
            .await
            .map_err(ConnectionError::WriteFailed)?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
        written += n;
    }
    writer.flush().await.map_err(ConnectionError::WriteFailed)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Error;
    use std::io::{self, Cursor};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Moves at most one byte per read or write call
    pub(crate) struct Trickle<T> {
        pub(crate) inner: T,
    }

    impl<T: AsyncRead + Unpin> AsyncRead for Trickle<T> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let mut byte = [0u8; 1];
            let mut one = ReadBuf::new(&mut byte);
            match Pin::new(&mut self.inner).poll_read(cx, &mut one) {
                Poll::Ready(Ok(())) => {
                    buf.put_slice(one.filled());
                    Poll::Ready(Ok(()))
                }
                other => other,
            }
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for Trickle<T> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let len = buf.len().min(1);
            Pin::new(&mut self.inner).poll_write(cx, &buf[..len])
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn frame_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_encode_layout() {
        let framer = Framer::default();
        let frame = frame_of(64);
        let message = framer.encode(&frame).unwrap();

        assert_eq!(message.len(), HEADER_SIZE + 64);
        assert_eq!(&message[..4], &[0xFF, 0xFF, 0x00, 0x40]);
        assert_eq!(&message[4..], &frame[..]);
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let framer = Framer::default();
        assert!(matches!(
            framer.encode(&frame_of(14)),
            Err(ProtocolError::BadSize { size: 14, .. })
        ));
        assert!(matches!(
            framer.encode(&frame_of(1515)),
            Err(ProtocolError::BadSize { size: 1515, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_write_boundaries() {
        let framer = Framer::default();
        for len in [MIN_FRAME_SIZE, 64, 1000, MAX_FRAME_SIZE] {
            let frame = frame_of(len);
            let mut wire = Vec::new();
            framer.write_message(&mut wire, &frame).await.unwrap();

            let mut reader = Cursor::new(wire);
            let decoded = framer.read_message(&mut reader).await.unwrap();
            assert_eq!(&decoded[..], &frame[..]);
        }
    }

    #[tokio::test]
    async fn test_bad_magic_consumes_no_payload() {
        let framer = Framer::default();
        let mut wire = vec![0xFF, 0xFE, 0x00, 0x40];
        wire.extend_from_slice(&frame_of(64));

        let mut reader = Cursor::new(wire);
        let err = framer.read_message(&mut reader).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::BadMagic([0xFF, 0xFE]))
        ));
        assert_eq!(reader.position(), HEADER_SIZE as u64);
    }

    #[tokio::test]
    async fn test_bad_size_rejected() {
        let framer = Framer::default();
        for size in [14u16, 1515] {
            let mut wire = MAGIC.to_vec();
            wire.extend_from_slice(&size.to_be_bytes());
            wire.extend_from_slice(&frame_of(size as usize));

            let err = framer.read_message(&mut Cursor::new(wire)).await.unwrap_err();
            assert!(
                matches!(err, Error::Protocol(ProtocolError::BadSize { size: s, .. }) if s == size as usize),
                "size {} accepted",
                size
            );
        }
    }

    #[tokio::test]
    async fn test_one_byte_transport() {
        let framer = Framer::default();
        let frame = frame_of(MAX_FRAME_SIZE);

        let mut writer = Trickle { inner: Vec::new() };
        framer.write_message(&mut writer, &frame).await.unwrap();
        assert_eq!(writer.inner.len(), HEADER_SIZE + MAX_FRAME_SIZE);

        let mut reader = Trickle {
            inner: Cursor::new(writer.inner),
        };
        let decoded = framer.read_message(&mut reader).await.unwrap();
        assert_eq!(&decoded[..], &frame[..]);
    }

    #[tokio::test]
    async fn test_peer_closes_mid_message() {
        let framer = Framer::default();
        let mut wire = framer.encode(&frame_of(100)).unwrap().to_vec();
        wire.truncate(HEADER_SIZE + 40);

        let err = framer.read_message(&mut Cursor::new(wire)).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
    }

    #[test]
    fn test_custom_limits() {
        let framer = Framer::new(60, 100_000);
        assert_eq!(framer.max_size(), u16::MAX as usize);
        assert!(framer.check_size(59).is_err());
        assert!(framer.check_size(60).is_ok());
    }
}
