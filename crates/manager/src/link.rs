use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Duration, Instant};

use taskmill_protocol::LINE_MAX;

const READ_CHUNK: usize = 64 * 1024;

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")
}

/// One worker connection: a TCP stream with a read buffer and
/// deadline-bounded, line-or-length framed operations.
#[derive(Debug)]
pub(crate) struct Connection {
    stream: TcpStream,
    buf: BytesMut,
    peer: SocketAddr,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Connection {
        Connection {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            peer,
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether a complete line is already buffered; such a connection must
    /// be drained before sleeping in the poll phase.
    pub(crate) fn has_buffered_line(&self) -> bool {
        self.buf.iter().any(|b| *b == b'\n')
    }

    /// Readiness probe used by the manager's poll table.
    pub(crate) fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_ready(cx)
    }

    async fn fill(&mut self, deadline: Instant) -> io::Result<()> {
        let n = timeout_at(deadline, self.stream.read_buf(&mut self.buf))
            .await
            .map_err(|_| timed_out())??;
        if n == 0 {
            return Err(closed());
        }
        Ok(())
    }

    /// Pull whatever is immediately available into the buffer without
    /// blocking. `Ok(false)` means the socket had nothing after all (a
    /// stale readiness indication); the attempt clears that indication.
    pub(crate) fn try_fill(&mut self) -> io::Result<bool> {
        self.buf.reserve(READ_CHUNK);
        match self.stream.try_read_buf(&mut self.buf) {
            Ok(0) => Err(closed()),
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Read one `\n`-terminated line, stripping the terminator.
    pub(crate) async fn read_line(&mut self, deadline: Instant) -> io::Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buf.len() > LINE_MAX {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "control line too long",
                ));
            }
            self.fill(deadline).await?;
        }
    }

    /// Read exactly `len` bytes of binary payload.
    pub(crate) async fn read_exact_bytes(
        &mut self,
        len: u64,
        deadline: Instant,
    ) -> io::Result<Vec<u8>> {
        let len = len as usize;
        let mut out = Vec::with_capacity(len.min(READ_CHUNK * 4));
        while out.len() < len {
            if self.buf.is_empty() {
                self.fill(deadline).await?;
            }
            let take = (len - out.len()).min(self.buf.len());
            out.extend_from_slice(&self.buf[..take]);
            self.buf.advance(take);
        }
        Ok(out)
    }

    /// Stream `len` bytes into `file` starting at `offset`.
    pub(crate) async fn read_to_file(
        &mut self,
        file: &mut tokio::fs::File,
        offset: u64,
        len: u64,
        deadline: Instant,
    ) -> io::Result<()> {
        use tokio::io::AsyncSeekExt;
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut remaining = len as usize;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill(deadline).await?;
            }
            let take = remaining.min(self.buf.len());
            file.write_all(&self.buf[..take]).await?;
            self.buf.advance(take);
            remaining -= take;
        }
        Ok(())
    }

    /// Read and discard `len` bytes, keeping the stream aligned after a
    /// payload the manager has no use for.
    pub(crate) async fn soak(&mut self, len: u64, deadline: Instant) -> io::Result<()> {
        let mut remaining = len as usize;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill(deadline).await?;
            }
            let take = remaining.min(self.buf.len());
            self.buf.advance(take);
            remaining -= take;
        }
        Ok(())
    }

    /// Send one control line; the terminator is appended here.
    pub(crate) async fn send_line(&mut self, line: &str, deadline: Instant) -> io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send_bytes(&data, deadline).await
    }

    /// Send raw bytes (pre-framed payloads and multi-line blocks).
    pub(crate) async fn send_bytes(&mut self, data: &[u8], deadline: Instant) -> io::Result<()> {
        timeout_at(deadline, self.stream.write_all(data))
            .await
            .map_err(|_| timed_out())??;
        Ok(())
    }
}

/// Deadline `secs` seconds from now.
pub(crate) fn deadline_in(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(server, peer), client)
    }

    #[tokio::test]
    async fn lines_and_payloads() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"hello world\nresult 0 0 3 1 9\nabc").await.unwrap();

        let line = conn.read_line(deadline_in(5)).await.unwrap();
        assert_eq!(line, "hello world");
        assert!(conn.has_buffered_line());

        let line = conn.read_line(deadline_in(5)).await.unwrap();
        assert_eq!(line, "result 0 0 3 1 9");
        let payload = conn.read_exact_bytes(3, deadline_in(5)).await.unwrap();
        assert_eq!(payload, b"abc");
        assert!(!conn.has_buffered_line());
    }

    #[tokio::test]
    async fn crlf_is_stripped() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"alive\r\n").await.unwrap();
        assert_eq!(conn.read_line(deadline_in(5)).await.unwrap(), "alive");
    }

    #[tokio::test]
    async fn read_deadline_fires() {
        let (mut conn, _client) = pair().await;
        let err = conn
            .read_line(Instant::now() + Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn closed_peer_is_an_error() {
        let (mut conn, client) = pair().await;
        drop(client);
        let err = conn.read_line(deadline_in(5)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn soak_discards_alignment_bytes() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"junkjunk\nnext\n").await.unwrap();
        conn.soak(9, deadline_in(5)).await.unwrap();
        assert_eq!(conn.read_line(deadline_in(5)).await.unwrap(), "next");
    }
}
