//! Framed file transfer
//!
//! Wire format: an 8-byte big-endian unsigned length, then exactly that many
//! payload bytes. The same framing is used for downloads and uploads.
//!
//! Reads from a socket routinely return fewer bytes than asked for; the
//! receive loop keeps reading until the declared length has been consumed
//! and only treats a zero-length read (peer closed) as an error.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single read/write while streaming
pub const FRAME_CHUNK_SIZE: usize = 0x10000;

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 8;

fn truncated(done: u64, total: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("stream ended after {} of {} bytes", done, total),
    )
}

/// Write the length prefix and then `len` bytes copied from `source`
pub async fn send_framed<R, W>(source: &mut R, sink: &mut W, len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    sink.write_all(&len.to_be_bytes()).await?;

    let mut buf = vec![0u8; FRAME_CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < len {
        let want = (len - sent).min(FRAME_CHUNK_SIZE as u64) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(truncated(sent, len));
        }
        sink.write_all(&buf[..n]).await?;
        sent += n as u64;
    }

    sink.flush().await?;
    Ok(())
}

/// Read the 8-byte length prefix
pub async fn read_frame_header<R>(source: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    source.read_exact(&mut header).await?;
    Ok(u64::from_be_bytes(header))
}

/// Copy exactly `len` payload bytes from `source` into `sink`
pub async fn recv_payload<R, W>(source: &mut R, sink: &mut W, len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; FRAME_CHUNK_SIZE];
    let mut received = 0u64;
    while received < len {
        let want = (len - received).min(FRAME_CHUNK_SIZE as u64) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(truncated(received, len));
        }
        sink.write_all(&buf[..n]).await?;
        received += n as u64;
    }

    sink.flush().await?;
    Ok(())
}

/// Receive one whole frame. Returns the payload length.
pub async fn recv_framed<R, W>(source: &mut R, sink: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = read_frame_header(source).await?;
    recv_payload(source, sink, len).await?;
    Ok(len)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Hands out at most a few bytes per read
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(self.step).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            self.step = self.step % 7 + 1;
            Poll::Ready(Ok(()))
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_frame_header_is_big_endian() {
        let mut wire = Vec::new();
        send_framed(&mut &b"abc"[..], &mut wire, 3).await.unwrap();

        assert_eq!(&wire[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&wire[8..], b"abc");
    }

    #[tokio::test]
    async fn test_receive_absorbs_partial_reads() {
        let data = payload(3 * FRAME_CHUNK_SIZE + 17);
        let mut wire = (data.len() as u64).to_be_bytes().to_vec();
        wire.extend_from_slice(&data);
        let mut source = Trickle {
            data: wire,
            pos: 0,
            step: 1,
        };

        let mut out = Vec::new();
        let len = recv_framed(&mut source, &mut out).await.unwrap();

        assert_eq!(len, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_round_trip_over_small_pipe() {
        let data = payload(200_000);
        let (mut client, mut server) = tokio::io::duplex(1024);

        let expected = data.clone();
        let receiver = tokio::spawn(async move {
            let mut out = Vec::new();
            recv_framed(&mut server, &mut out).await.unwrap();
            out
        });

        send_framed(&mut &data[..], &mut client, data.len() as u64)
            .await
            .unwrap();

        assert_eq!(receiver.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_bytes_after_frame_are_left_alone() {
        let mut wire = 4u64.to_be_bytes().to_vec();
        wire.extend_from_slice(b"datasuccess\n");
        let mut source = &wire[..];

        let mut out = Vec::new();
        recv_framed(&mut source, &mut out).await.unwrap();

        assert_eq!(out, b"data");
        assert_eq!(source, b"success\n");
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut wire = 100u64.to_be_bytes().to_vec();
        wire.extend_from_slice(&[1u8; 40]);

        let mut out = Vec::new();
        let err = recv_framed(&mut &wire[..], &mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_short_source_fails_send() {
        let mut wire = Vec::new();
        let err = send_framed(&mut &b"abc"[..], &mut wire, 10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
