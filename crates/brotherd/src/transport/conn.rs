// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Buffered, timeout-bounded socket handle.

use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Receive buffer backing `peek` / `read` on stream connections.
pub(crate) const RX_BUF_SIZE: usize = 2048;

/// Connect attempts per `reconnect` call.
const CONNECT_ATTEMPTS: u32 = 3;

/// Pause before each connect attempt. Some firmware refuses a connection
/// that arrives too soon after the previous session's FIN.
const CONNECT_DELAY: Duration = Duration::from_millis(25);

/// Socket kind selected at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Datagram socket (SNMP, button-press notifications).
    Udp,
    /// Stream socket (scan data channel).
    Tcp,
}

/// Underlying socket in its current lifecycle stage.
enum Sock {
    /// Created with options applied, no traffic exchanged yet.
    Pending(Socket),
    Udp(UdpSocket),
    Tcp(TcpStream),
    /// No live socket (stream between sessions).
    Down,
}

/// A single buffered network connection.
///
/// The stream variant owns a [`RX_BUF_SIZE`]-byte receive buffer; `peek(n)`
/// and `read(n)` always deliver `n` consecutive bytes or fail, regardless of
/// how the peer segmented them. The OS receive timeout set at [`Conn::open`]
/// bounds each underlying syscall, not the whole peek/read.
pub struct Conn {
    kind: ConnKind,
    timeout: Duration,
    local_port: Option<u16>,
    sock: Sock,
    peer: Option<SocketAddrV4>,
    rxbuf: Vec<u8>,
    rd: usize,
    wr: usize,
}

fn make_socket(kind: ConnKind, timeout: Duration) -> Result<Socket> {
    let ty = match kind {
        ConnKind::Udp => Type::DGRAM,
        ConnKind::Tcp => Type::STREAM,
    };
    let proto = match kind {
        ConnKind::Udp => Protocol::UDP,
        ConnKind::Tcp => Protocol::TCP,
    };
    let socket = Socket::new(Domain::IPV4, ty, Some(proto))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;
    Ok(socket)
}

/// Wait for `fd` to become readable, retrying interrupted syscalls against
/// the original deadline.
fn poll_readable_fd(fd: RawFd, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid, initialized pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        return Ok(rc > 0);
    }
}

impl Conn {
    /// Create a socket of the given kind with `timeout` bounding every
    /// send/receive syscall.
    pub fn open(kind: ConnKind, timeout: Duration) -> Result<Self> {
        let sock = match kind {
            ConnKind::Udp => Sock::Pending(make_socket(kind, timeout)?),
            // Stream sockets are created per `reconnect`; nothing to hold yet.
            ConnKind::Tcp => Sock::Down,
        };
        let rxbuf = match kind {
            ConnKind::Udp => Vec::new(),
            ConnKind::Tcp => vec![0u8; RX_BUF_SIZE],
        };
        Ok(Conn {
            kind,
            timeout,
            local_port: None,
            sock,
            peer: None,
            rxbuf,
            rd: 0,
            wr: 0,
        })
    }

    /// Bind to `0.0.0.0:local_port`. The port is remembered and re-applied
    /// by every [`Conn::reconnect`].
    pub fn bind(&mut self, local_port: u16) -> Result<()> {
        self.local_port = Some(local_port);
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port));
        match &self.sock {
            Sock::Pending(socket) => {
                socket.bind(&addr.into())?;
                Ok(())
            }
            // Stream sockets bind inside reconnect.
            Sock::Down => Ok(()),
            _ => Err(Error::InvalidState("bind after socket is in use")),
        }
    }

    /// Drop any current stream, create a fresh socket (re-binding the
    /// recorded local port) and connect to `dest`, trying up to three times
    /// with a short pause before each attempt.
    pub fn reconnect(&mut self, dest: SocketAddrV4) -> Result<()> {
        if self.kind != ConnKind::Tcp {
            return Err(Error::UnsupportedOp("reconnect on a datagram socket"));
        }

        self.sock = Sock::Down;
        self.rd = 0;
        self.wr = 0;

        let mut last_err: Option<std::io::Error> = None;
        for _ in 0..CONNECT_ATTEMPTS {
            std::thread::sleep(CONNECT_DELAY);

            let socket = make_socket(self.kind, self.timeout)?;
            if let Some(port) = self.local_port {
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
                socket.bind(&addr.into())?;
            }

            match socket.connect_timeout(&SocketAddr::V4(dest).into(), self.timeout) {
                Ok(()) => {
                    self.sock = Sock::Tcp(socket.into());
                    self.peer = Some(dest);
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }

        log::error!("[conn] connect to {} failed: {:?}", dest, last_err);
        match last_err {
            Some(err) => Err(Error::Io(err)),
            None => Err(Error::InvalidState("connect failed without an error")),
        }
    }

    /// Remember the currently bound local port so every later
    /// [`Conn::reconnect`] binds it again. No-op once a port is recorded.
    pub fn pin_local_port(&mut self) -> Result<u16> {
        if let Some(port) = self.local_port {
            return Ok(port);
        }
        let port = match &self.sock {
            Sock::Pending(socket) => socket
                .local_addr()?
                .as_socket()
                .ok_or(Error::InvalidState("local address unavailable"))?
                .port(),
            Sock::Tcp(stream) => stream.local_addr()?.port(),
            Sock::Udp(socket) => socket.local_addr()?.port(),
            Sock::Down => return Err(Error::InvalidState("no bound socket to pin")),
        };
        self.local_port = Some(port);
        Ok(port)
    }

    /// Finalize a pending datagram socket on first use.
    fn udp(&mut self) -> Result<&UdpSocket> {
        if let Sock::Pending(_) = self.sock {
            match std::mem::replace(&mut self.sock, Sock::Down) {
                Sock::Pending(socket) => self.sock = Sock::Udp(socket.into()),
                _ => unreachable!(),
            }
        }
        match &self.sock {
            Sock::Udp(socket) => Ok(socket),
            _ => Err(Error::UnsupportedOp("datagram I/O on a stream socket")),
        }
    }

    fn tcp(&mut self) -> Result<&mut TcpStream> {
        match &mut self.sock {
            Sock::Tcp(stream) => Ok(stream),
            _ => Err(Error::InvalidState("stream is not connected")),
        }
    }

    /// Send one datagram to an explicit destination (datagram sockets only).
    pub fn sendto(&mut self, buf: &[u8], dest: SocketAddrV4) -> Result<usize> {
        if self.kind != ConnKind::Udp {
            return Err(Error::UnsupportedOp("sendto on a stream socket"));
        }
        let socket = self.udp()?;
        let sent = retry_eintr(|| socket.send_to(buf, SocketAddr::V4(dest)))?;
        super::dump("send", buf);
        log::debug!("[conn] sent {}/{} bytes to {}", sent, buf.len(), dest);
        Ok(sent)
    }

    /// Send to the current peer: one datagram (UDP) or a stream write (TCP).
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        let sent = match self.kind {
            ConnKind::Udp => {
                let peer = self
                    .peer
                    .ok_or(Error::InvalidState("send without a known peer"))?;
                let socket = self.udp()?;
                retry_eintr(|| socket.send_to(buf, SocketAddr::V4(peer)))?
            }
            ConnKind::Tcp => {
                let stream = self.tcp()?;
                retry_eintr(|| stream.write(buf))?
            }
        };
        super::dump("send", buf);
        log::debug!("[conn] sent {}/{} bytes", sent, buf.len());
        Ok(sent)
    }

    /// Block until the socket is readable or `timeout` expires.
    ///
    /// Readiness of bytes already sitting in the stream buffer is the
    /// caller's concern (see [`Conn::buffered`]); this waits on the socket
    /// itself.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool> {
        if self.kind == ConnKind::Udp {
            // Make sure a pollable fd exists.
            self.udp()?;
        }
        let fd = match &self.sock {
            Sock::Pending(socket) => socket.as_raw_fd(),
            Sock::Udp(socket) => socket.as_raw_fd(),
            Sock::Tcp(stream) => stream.as_raw_fd(),
            Sock::Down => return Err(Error::InvalidState("poll on a closed connection")),
        };
        poll_readable_fd(fd, timeout)
    }

    /// Receive at most `buf.len()` bytes. Datagram sockets record the peer
    /// address; stream sockets drain the receive buffer before touching the
    /// socket so `receive` and `read` never reorder data.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self.kind {
            ConnKind::Udp => {
                let socket = self.udp()?;
                let (n, from) = retry_eintr(|| socket.recv_from(buf))?;
                if let SocketAddr::V4(addr) = from {
                    self.peer = Some(addr);
                }
                n
            }
            ConnKind::Tcp => {
                let buffered = self.wr - self.rd;
                if buffered > 0 {
                    let n = buffered.min(buf.len());
                    buf[..n].copy_from_slice(&self.rxbuf[self.rd..self.rd + n]);
                    self.rd += n;
                    n
                } else {
                    let stream = self.tcp()?;
                    retry_eintr(|| stream.read(buf))?
                }
            }
        };
        super::dump("recv", &buf[..n]);
        log::debug!("[conn] received {} bytes", n);
        Ok(n)
    }

    /// Number of buffered-but-unread bytes (stream sockets).
    pub fn buffered(&self) -> usize {
        self.wr - self.rd
    }

    /// Ensure at least `n` bytes are buffered, reading from the socket as
    /// needed. Does not consume.
    fn fill_to(&mut self, n: usize) -> Result<()> {
        if self.kind != ConnKind::Tcp {
            return Err(Error::UnsupportedOp("peek on a datagram socket"));
        }
        if n > RX_BUF_SIZE {
            return Err(Error::InvalidState("peek beyond receive buffer capacity"));
        }

        // Compact when the tail cannot hold the requested span.
        if self.rd + n > RX_BUF_SIZE {
            self.rxbuf.copy_within(self.rd..self.wr, 0);
            self.wr -= self.rd;
            self.rd = 0;
        }

        while self.wr - self.rd < n {
            let wr = self.wr;
            let stream = match &mut self.sock {
                Sock::Tcp(stream) => stream,
                _ => return Err(Error::InvalidState("stream is not connected")),
            };
            let tail = &mut self.rxbuf[wr..];
            let got = retry_eintr(|| stream.read(tail))?;
            if got == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )));
            }
            self.wr += got;
        }
        Ok(())
    }

    /// Return the next `n` buffered bytes without consuming them.
    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        self.fill_to(n)?;
        Ok(&self.rxbuf[self.rd..self.rd + n])
    }

    /// Return the next `n` buffered bytes and advance the read cursor.
    pub fn read(&mut self, n: usize) -> Result<&[u8]> {
        self.fill_to(n)?;
        let start = self.rd;
        self.rd += n;
        super::dump("read", &self.rxbuf[start..start + n]);
        Ok(&self.rxbuf[start..start + n])
    }

    /// Ensure `n` bytes are available to [`Conn::read`]: immediate if
    /// already buffered, otherwise one poll bounded by `timeout` followed
    /// by the blocking fill.
    pub fn fill_buffer(&mut self, n: usize, timeout: Duration) -> Result<()> {
        if self.kind != ConnKind::Tcp {
            return Err(Error::UnsupportedOp("fill_buffer on a datagram socket"));
        }
        if self.buffered() >= n {
            return Ok(());
        }
        if !self.poll(timeout)? {
            return Err(Error::Timeout);
        }
        self.fill_to(n)
    }

    /// Printable IPv4 of the local endpoint.
    pub fn local_ip(&self) -> Result<Ipv4Addr> {
        let addr = match &self.sock {
            Sock::Pending(socket) => socket.local_addr()?.as_socket(),
            Sock::Udp(socket) => Some(socket.local_addr()?),
            Sock::Tcp(stream) => Some(stream.local_addr()?),
            Sock::Down => None,
        };
        match addr {
            Some(SocketAddr::V4(v4)) => Ok(*v4.ip()),
            _ => Err(Error::InvalidState("local address unavailable")),
        }
    }

    /// Printable IPv4 of the peer (last datagram source or connect target).
    pub fn peer_ip(&self) -> Result<Ipv4Addr> {
        self.peer
            .map(|addr| *addr.ip())
            .ok_or(Error::InvalidState("peer address unavailable"))
    }
}

/// Retry a syscall-backed operation while it reports `Interrupted`.
fn retry_eintr<T>(mut op: impl FnMut() -> std::io::Result<T>) -> Result<T> {
    loop {
        match op() {
            Ok(val) => return Ok(val),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn stream_pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = match listener.local_addr().expect("listener addr") {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };
        let mut conn = Conn::open(ConnKind::Tcp, Duration::from_secs(2)).expect("open");
        conn.reconnect(addr).expect("connect");
        let (peer, _) = listener.accept().expect("accept");
        (conn, peer)
    }

    #[test]
    fn read_joins_torn_segments() {
        let (mut conn, mut peer) = stream_pair();

        peer.write_all(b"abc").expect("write");
        // Second half arrives a moment later; read(6) must block through it.
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            peer.write_all(b"def").expect("write");
            peer
        });

        assert_eq!(conn.read(6).expect("read"), b"abcdef");
        writer.join().expect("join");
    }

    #[test]
    fn peek_does_not_consume() {
        let (mut conn, mut peer) = stream_pair();
        peer.write_all(b"hello").expect("write");

        assert_eq!(conn.peek(5).expect("peek"), b"hello");
        assert_eq!(conn.buffered(), 5);
        assert_eq!(conn.read(5).expect("read"), b"hello");
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn buffer_compaction_preserves_unread_bytes() {
        let (mut conn, mut peer) = stream_pair();

        // Fill most of the buffer, consume all but a small tail, then ask
        // for a span that only fits after compaction.
        let first = vec![0x41u8; RX_BUF_SIZE - 8];
        peer.write_all(&first).expect("write");
        conn.read(first.len() - 4).expect("read bulk");
        assert_eq!(conn.buffered(), 4);

        peer.write_all(&[0x42u8; 12]).expect("write tail");
        let got = conn.read(16).expect("read across compaction");
        assert_eq!(&got[..4], b"AAAA");
        assert_eq!(&got[4..], &[0x42u8; 12]);
    }

    #[test]
    fn peek_past_capacity_is_rejected() {
        let (mut conn, _peer) = stream_pair();
        assert!(conn.peek(RX_BUF_SIZE + 1).is_err());
    }

    #[test]
    fn peek_on_udp_is_rejected() {
        let mut conn = Conn::open(ConnKind::Udp, Duration::from_millis(100)).expect("open");
        assert!(matches!(conn.peek(1), Err(Error::UnsupportedOp(_))));
    }

    #[test]
    fn fill_buffer_times_out_without_data() {
        let (mut conn, _peer) = stream_pair();
        let err = conn
            .fill_buffer(1, Duration::from_millis(20))
            .expect_err("no data was sent");
        assert!(err.is_timeout());
    }

    #[test]
    fn udp_receive_records_peer() {
        let mut server = Conn::open(ConnKind::Udp, Duration::from_secs(1)).expect("open");
        server.bind(0).expect("bind");
        // A bound-to-port-0 socket reports the ephemeral port it got.
        let server_ip = server.local_ip().expect("local ip");
        assert_eq!(server_ip, Ipv4Addr::UNSPECIFIED);

        let port = {
            // Finalized lazily; send something to learn the port.
            let sender = UdpSocket::bind("127.0.0.1:0").expect("bind sender");
            let dest = {
                // Fish the port out via poll-side socket.
                match &server.sock {
                    Sock::Pending(s) => s.local_addr().expect("addr").as_socket().expect("v4"),
                    _ => unreachable!(),
                }
            };
            sender.send_to(b"ping", dest).expect("send");
            sender.local_addr().expect("sender addr").port()
        };

        assert!(server.poll(Duration::from_secs(1)).expect("poll"));
        let mut buf = [0u8; 16];
        let n = server.receive(&mut buf).expect("receive");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(server.peer_ip().expect("peer"), Ipv4Addr::LOCALHOST);
        assert_eq!(server.peer.expect("peer").port(), port);
    }

    #[test]
    fn reconnect_binds_the_pinned_local_port() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = match listener.local_addr().expect("addr") {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };

        // Borrow a free port from the OS, release it, then pin it.
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        let pinned_port = probe.local_addr().expect("probe addr").port();
        drop(probe);

        let mut conn = Conn::open(ConnKind::Tcp, Duration::from_secs(2)).expect("open");
        conn.bind(pinned_port).expect("bind");
        conn.reconnect(addr).expect("connect");

        let (peer, from) = listener.accept().expect("accept");
        assert_eq!(from.port(), pinned_port);
        drop(peer);
    }
}
