//! Buffered peer socket with a write queue.
use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::net;

use crate::net::Link;

/// A socket with an associated address and link direction. Writes are
/// queued and flushed when the underlying stream is ready.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    /// The remote peer address.
    pub address: net::SocketAddr,
    /// Link direction of this connection.
    pub link: Link,
    /// Bytes waiting to be written out.
    queue: VecDeque<Vec<u8>>,
}

impl<R: Read + Write> Socket<R> {
    /// Create a socket from a raw stream.
    pub fn from(raw: R, address: net::SocketAddr, link: Link) -> Self {
        Self {
            raw,
            address,
            link,
            queue: VecDeque::new(),
        }
    }

    /// Queue bytes to be written when the socket is next flushed.
    pub fn push(&mut self, bytes: &[u8]) {
        self.queue.push_back(bytes.to_vec());
    }

    /// Write all queued bytes out. On `WouldBlock`, the unwritten remainder
    /// is re-queued and the error is returned so that the caller keeps the
    /// write interest registered.
    pub fn drain(&mut self) -> io::Result<()> {
        while let Some(buf) = self.queue.pop_front() {
            match self.raw.write(&buf) {
                Ok(n) if n < buf.len() => {
                    self.queue.push_front(buf[n..].to_vec());
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.queue.push_front(buf);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        self.raw.flush()
    }
}

impl<R: Read + Write> Read for Socket<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }
}

impl Socket<net::TcpStream> {
    /// The local address of this socket.
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }

    /// Shut the connection down. Queued writes are discarded.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stream that accepts at most `cap` bytes per write call.
    struct Sink {
        written: Vec<u8>,
        cap: usize,
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.cap);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Sink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    fn socket(cap: usize) -> Socket<Sink> {
        Socket::from(
            Sink {
                written: Vec::new(),
                cap,
            },
            ([127, 0, 0, 1], 8121).into(),
            Link::Outbound,
        )
    }

    #[test]
    fn test_drain_writes_queued_buffers_in_order() {
        let mut socket = socket(64);

        socket.push(b"hello ");
        socket.push(b"world");
        socket.drain().unwrap();

        assert_eq!(socket.raw.written, b"hello world");
        assert!(socket.queue.is_empty());
    }

    #[test]
    fn test_partial_write_requeues_remainder() {
        let mut socket = socket(4);

        socket.push(b"goldcoin");
        let err = socket.drain().unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(socket.raw.written, b"gold");
        assert_eq!(socket.queue.front().map(|b| b.as_slice()), Some(&b"coin"[..]));
    }
}
