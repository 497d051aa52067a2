use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

// A TLS record is a 5-byte header (type, version, length) followed by
// `length` bytes of payload.
const TLS_RECORD_HEADER_LEN: usize = 5;
// Upper bound on the fragment length per RFC 8446. Anything larger is not a
// TLS record and gets rejected before we buffer it.
const TLS_MAX_FRAGMENT_LEN: usize = 16_384 + 256;

/// Read exactly one complete TLS record from the stream, returning the raw
/// bytes consumed (header included). The caller is expected to wrap the
/// stream in a [`ReplayStream`] with these bytes so the backend sees them
/// again.
pub(crate) async fn read_tls_record<S>(stream: &mut S) -> io::Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(TLS_RECORD_HEADER_LEN);
    buffer.resize(TLS_RECORD_HEADER_LEN, 0);
    stream.read_exact(&mut buffer).await?;
    let length = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    if length == 0 || length > TLS_MAX_FRAGMENT_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid TLS record length",
        ));
    }
    buffer.resize(TLS_RECORD_HEADER_LEN + length, 0);
    stream.read_exact(&mut buffer[TLS_RECORD_HEADER_LEN..]).await?;
    Ok(buffer)
}

/// Stream decorator that replays a consumed prefix before handing reads over
/// to the inner stream. Writes pass through untouched, so splicing this into
/// `copy_bidirectional` forwards the peeked bytes losslessly.
#[derive(Debug)]
pub(crate) struct ReplayStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub(crate) fn new(prefix: BytesMut, inner: S) -> Self {
        ReplayStream { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let count = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..count]);
            self.prefix.advance(count);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod peek_tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn reads_one_complete_record() {
        let (mut client, mut server) = duplex(1024);
        let record = [&[0x16, 0x03, 0x01, 0x00, 0x04][..], &[1, 2, 3, 4][..]].concat();
        client.write_all(&record).await.unwrap();
        client.write_all(b"trailing").await.unwrap();
        let peeked = read_tls_record(&mut server).await.unwrap();
        assert_eq!(&peeked[..], &record[..]);
        let mut rest = [0u8; 8];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"trailing");
    }

    #[tokio::test]
    async fn rejects_oversized_record_length() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[0x16, 0x03, 0x01, 0xff, 0xff])
            .await
            .unwrap();
        assert!(read_tls_record(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn fails_on_truncated_stream() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[0x16, 0x03, 0x01, 0x00, 0x10, 1, 2])
            .await
            .unwrap();
        drop(client);
        assert!(read_tls_record(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn replay_stream_is_lossless() {
        let (mut client, server) = duplex(1024);
        client.write_all(b" world").await.unwrap();
        drop(client);
        let mut stream = ReplayStream::new(BytesMut::from(&b"hello"[..]), server);
        let mut output = Vec::new();
        stream.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"hello world");
    }

    #[tokio::test]
    async fn replay_stream_handles_small_read_buffers() {
        let (client, server) = duplex(16);
        drop(client);
        let mut stream = ReplayStream::new(BytesMut::from(&b"abcdef"[..]), server);
        let mut chunk = [0u8; 4];
        stream.read_exact(&mut chunk).await.unwrap();
        assert_eq!(&chunk, b"abcd");
        let mut tail = [0u8; 2];
        stream.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"ef");
    }
}
