//! Full-duplex connection wrapper shared by one reader and one writer
//! thread.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use rustls::ClientConnection;

/// One established transport connection.
///
/// The wrapper is designed for exactly one concurrent reader and one
/// concurrent writer, which is the shape of every consumer: a sender thread
/// writing frames while an ack-reader thread blocks on incoming frames. For
/// TLS the record layer is a single state machine guarded by a mutex; raw
/// socket reads happen *outside* that lock so a blocked reader never stalls
/// the writer, and every socket write (application data and handshake
/// upkeep alike) happens under it so records are serialised.
///
/// [`Connection::close`] shuts the socket down in both directions, which is
/// also the documented way to unblock a thread stuck in [`Read::read`].
pub struct Connection {
    inner: Inner,
}

enum Inner {
    Plain(PlainConn),
    Tls(Box<TlsConn>),
}

struct PlainConn {
    read: TcpStream,
    write: TcpStream,
}

struct TlsConn {
    tls: Mutex<ClientConnection>,
    plain: Mutex<VecDeque<u8>>,
    read_sock: TcpStream,
    write_sock: TcpStream,
}

impl Connection {
    /// Wraps a completed TLS session over `stream`.
    pub fn tls(stream: TcpStream, session: ClientConnection) -> io::Result<Self> {
        let read_sock = stream.try_clone()?;
        Ok(Self {
            inner: Inner::Tls(Box::new(TlsConn {
                tls: Mutex::new(session),
                plain: Mutex::new(VecDeque::new()),
                read_sock,
                write_sock: stream,
            })),
        })
    }

    /// Wraps a plain TCP stream. Used by unit tests and loopback tooling;
    /// production sessions always negotiate TLS.
    pub fn plain(stream: TcpStream) -> io::Result<Self> {
        let read = stream.try_clone()?;
        Ok(Self {
            inner: Inner::Plain(PlainConn {
                read,
                write: stream,
            }),
        })
    }

    /// Reads available plaintext into `buf`, blocking per the socket's read
    /// timeout. Returns `Ok(0)` on orderly EOF.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            Inner::Plain(conn) => (&conn.read).read(buf),
            Inner::Tls(conn) => conn.read(buf),
        }
    }

    /// Writes the whole buffer, bounded by the socket write deadline.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match &self.inner {
            Inner::Plain(conn) => (&conn.write).write_all(buf),
            Inner::Tls(conn) => conn.write_all(buf),
        }
    }

    /// Arms or clears the read timeout observed by [`Connection::read`].
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            Inner::Plain(conn) => conn.read.set_read_timeout(timeout),
            Inner::Tls(conn) => conn.read_sock.set_read_timeout(timeout),
        }
    }

    /// Returns the peer address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            Inner::Plain(conn) => conn.read.peer_addr(),
            Inner::Tls(conn) => conn.read_sock.peer_addr(),
        }
    }

    /// Half-closes the write direction, signalling end of stream to the
    /// server while the read direction stays open for its reply.
    pub fn close_write(&self) {
        match &self.inner {
            Inner::Plain(conn) => {
                let _ = conn.write.shutdown(Shutdown::Write);
            }
            Inner::Tls(conn) => {
                let mut tls = conn
                    .tls
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                tls.send_close_notify();
                while tls.wants_write() {
                    if tls.write_tls(&mut (&conn.write_sock)).is_err() {
                        break;
                    }
                }
                drop(tls);
                let _ = conn.write_sock.shutdown(Shutdown::Write);
            }
        }
    }

    /// Shuts the socket down in both directions, waking any blocked reader.
    pub fn close(&self) {
        let stream = match &self.inner {
            Inner::Plain(conn) => &conn.write,
            Inner::Tls(conn) => &conn.write_sock,
        };
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl Read for &Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Connection::read(self, buf)
    }
}

impl Write for &Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Connection::write_all(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut plain = self
                    .plain
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !plain.is_empty() {
                    let n = plain.len().min(buf.len());
                    for byte in &mut buf[..n] {
                        *byte = plain.pop_front().unwrap_or(0);
                    }
                    return Ok(n);
                }
            }

            // Block on the raw socket without holding the record-layer
            // lock; the writer keeps making progress meanwhile.
            let mut raw = [0u8; 16 * 1024];
            let n = (&self.read_sock).read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }

            let mut tls = self
                .tls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut slice = &raw[..n];
            while !slice.is_empty() {
                let consumed = tls.read_tls(&mut slice)?;
                if consumed == 0 {
                    break;
                }
                let state = tls
                    .process_new_packets()
                    .map_err(|err| io::Error::other(err.to_string()))?;
                let pending = state.plaintext_bytes_to_read();
                if pending > 0 {
                    let mut chunk = vec![0u8; pending];
                    tls.reader().read_exact(&mut chunk)?;
                    self.plain
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .extend(chunk);
                }
            }
            // Session upkeep (key updates, tickets) may queue records.
            while tls.wants_write() {
                tls.write_tls(&mut (&self.write_sock))?;
            }
        }
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut tls = self
            .tls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tls.writer().write_all(buf)?;
        while tls.wants_write() {
            tls.write_tls(&mut (&self.write_sock))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        let conn = Connection::plain(client.join().unwrap()).unwrap();
        (conn, server)
    }

    #[test]
    fn plain_round_trip() {
        let (conn, mut server) = pair();
        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        let mut buf = [0u8; 4];
        (&conn).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn close_unblocks_reader() {
        let (conn, _server) = pair();
        let conn = std::sync::Arc::new(conn);
        let reader = {
            let conn = std::sync::Arc::clone(&conn);
            thread::spawn(move || {
                let mut buf = [0u8; 1];
                conn.read(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(50));
        conn.close();
        let result = reader.join().unwrap();
        // Either orderly EOF or a reset, but never a hang.
        match result {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected read of {n} bytes"),
        }
    }

    #[test]
    fn read_timeout_is_honoured() {
        let (conn, _server) = pair();
        conn.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).unwrap_err();
        assert!(
            err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut,
            "unexpected kind {:?}",
            err.kind()
        );
    }

    #[test]
    fn concurrent_reader_and_writer_make_progress() {
        let (conn, mut server) = pair();
        let conn = std::sync::Arc::new(conn);

        let reader = {
            let conn = std::sync::Arc::clone(&conn);
            thread::spawn(move || {
                let mut buf = [0u8; 5];
                (&*conn).read_exact(&mut buf).unwrap();
                buf
            })
        };

        // Writer proceeds while the reader is blocked.
        conn.write_all(b"hello from the client").unwrap();
        let mut buf = [0u8; 21];
        server.read_exact(&mut buf).unwrap();

        server.write_all(b"reply").unwrap();
        assert_eq!(&reader.join().unwrap(), b"reply");
    }
}
