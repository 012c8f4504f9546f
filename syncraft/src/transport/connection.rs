//! A non-blocking, length-framed TCP connection to one peer.

use std::collections::VecDeque;
use std::io;
use std::io::IoSlice;
use std::io::Read;
use std::io::Write;
use std::time::Instant;

use mio::net::TcpStream;

use crate::poller::Poller;
use crate::poller::Readiness;
use crate::poller::Token;
use crate::raft_types::NodeAddress;

/// Frame length prefix: 4-byte little-endian payload length.
const LEN_HEADER_SIZE: usize = 4;

/// Frames larger than this indicate a corrupt stream or a hostile peer.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Result of handling a readiness event on a connection.
///
/// `Alive` means the connection is still usable. `Dead` means the peer is
/// gone and the transport must drop (and possibly rebuild) the channel.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    Alive,
    Dead,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Accumulating the 4-byte length header.
    ReadingHeader { buf: [u8; LEN_HEADER_SIZE], have: usize },
    /// Reading the payload of `msg_len` bytes.
    ReadingPayload { msg_len: usize, offset: usize },
}

/// A single non-blocking peer connection.
///
/// Outbound: `send` frames the message and attempts an immediate write; any
/// unwritten remainder lands in a backlog which is flushed whenever the
/// socket reports writable. WRITE interest is armed only while the backlog
/// is non-empty.
///
/// Inbound: bytes are assembled into whole length-prefixed frames; partial
/// reads are buffered across events. Complete frames pile up in `inbound`
/// until the transport drains them.
///
/// An outbound connection starts in the connecting state; the first writable
/// event confirms (or refutes) the TCP handshake.
pub(crate) struct TcpConnection {
    stream: TcpStream,
    pub(crate) token: Token,
    /// The peer this connection is bound to. Accepted connections stay
    /// unbound until the peer introduces itself with a Hello frame.
    pub(crate) peer: Option<NodeAddress>,
    /// True if this side dialed the connection.
    pub(crate) outbound: bool,
    /// False while an outbound TCP handshake is still in flight.
    pub(crate) established: bool,

    rx_state: RxState,
    rx_buf: Vec<u8>,
    /// Complete frames waiting to be decoded by the transport.
    pub(crate) inbound: VecDeque<Vec<u8>>,

    send_backlog: VecDeque<Vec<u8>>,
    /// Invariant: `writable_armed == (!established || !send_backlog.is_empty())`.
    writable_armed: bool,

    /// Last time any bytes arrived; drives the idle disconnect.
    pub(crate) last_recv: Instant,
}

impl TcpConnection {
    pub(crate) fn new(stream: TcpStream, token: Token, outbound: bool, recv_buffer_size: usize) -> Self {
        Self {
            stream,
            token,
            peer: None,
            outbound,
            established: !outbound,
            rx_state: RxState::ReadingHeader {
                buf: [0; LEN_HEADER_SIZE],
                have: 0,
            },
            rx_buf: vec![0; recv_buffer_size],
            inbound: VecDeque::new(),
            send_backlog: VecDeque::new(),
            // Outbound connections are registered with WRITE interest so the
            // handshake completion surfaces as a writable event.
            writable_armed: outbound,
            last_recv: Instant::now(),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Handle one readiness event, assembling inbound frames and flushing
    /// the send backlog as the socket allows.
    pub(crate) fn handle_event(&mut self, poller: &Poller, readiness: Readiness) -> ConnState {
        if self.outbound && !self.established && (readiness.write || readiness.error) {
            match self.finish_connect() {
                Ok(()) => {
                    self.established = true;
                }
                Err(err) => {
                    tracing::debug!(error=%err, "outbound connect failed");
                    return ConnState::Dead;
                }
            }
        }

        if readiness.read {
            loop {
                match self.read_frame() {
                    ReadOutcome::Frame(frame) => {
                        self.inbound.push_back(frame);
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Dead => return ConnState::Dead,
                }
            }
        }

        if readiness.write {
            if self.drain_backlog(poller) == ConnState::Dead {
                return ConnState::Dead;
            }
        }

        if readiness.error && !readiness.read && !readiness.write {
            return ConnState::Dead;
        }

        ConnState::Alive
    }

    /// Frame and send a message, buffering whatever the kernel won't take.
    pub(crate) fn send(&mut self, poller: &Poller, body: &[u8]) -> ConnState {
        let header = (body.len() as u32).to_le_bytes();

        // While connecting, or while older frames are queued, everything
        // goes through the backlog to preserve send order.
        if !self.established || !self.send_backlog.is_empty() {
            self.send_backlog.push_back(header.to_vec());
            self.send_backlog.push_back(body.to_vec());
            return self.arm_writable(poller);
        }

        match self
            .stream
            .write_vectored(&[IoSlice::new(&header), IoSlice::new(body)])
        {
            Ok(0) => ConnState::Dead,
            Ok(n) if n == LEN_HEADER_SIZE + body.len() => ConnState::Alive,
            Ok(n) if n < LEN_HEADER_SIZE => {
                self.send_backlog.push_back(header[n..].to_vec());
                self.send_backlog.push_back(body.to_vec());
                self.arm_writable(poller)
            }
            Ok(n) => {
                self.send_backlog.push_back(body[n - LEN_HEADER_SIZE..].to_vec());
                self.arm_writable(poller)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.send_backlog.push_back(header.to_vec());
                self.send_backlog.push_back(body.to_vec());
                self.arm_writable(poller)
            }
            Err(err) => {
                tracing::debug!(error=%err, "connection write failed");
                ConnState::Dead
            }
        }
    }

    /// Check whether the idle threshold has elapsed without inbound bytes.
    pub(crate) fn is_idle(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.duration_since(self.last_recv) >= timeout
    }

    /// Deregister and shut the socket down.
    pub(crate) fn close(&mut self, poller: &Poller) {
        let _ = poller.unsubscribe(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn finish_connect(&mut self) -> io::Result<()> {
        // A connect error is reported through SO_ERROR once the socket
        // becomes writable.
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "handshake incomplete"))
            }
            Err(e) => Err(e),
        }
    }

    /// Flush queued data until the kernel blocks or the queue is empty, then
    /// drop WRITE interest.
    fn drain_backlog(&mut self, poller: &Poller) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Dead,
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::debug!(error=%err, "connection backlog write failed");
                    return ConnState::Dead;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if poller.modify(&mut self.stream, self.token, Readiness::READ).is_err() {
                return ConnState::Dead;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    fn arm_writable(&mut self, poller: &Poller) -> ConnState {
        if !self.writable_armed {
            if poller
                .modify(&mut self.stream, self.token, Readiness::READ_WRITE)
                .is_err()
            {
                return ConnState::Dead;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    /// Read a single complete frame if present.
    fn read_frame(&mut self) -> ReadOutcome {
        loop {
            match self.rx_state {
                RxState::ReadingHeader { mut buf, mut have } => {
                    while have < LEN_HEADER_SIZE {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Dead,
                            Ok(n) => {
                                have += n;
                                self.last_recv = Instant::now();
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingHeader { buf, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                tracing::debug!(error=%err, "connection header read failed");
                                return ReadOutcome::Dead;
                            }
                        }
                    }
                    let msg_len = u32::from_le_bytes(buf) as usize;
                    if msg_len > MAX_FRAME_SIZE {
                        tracing::warn!(msg_len, "oversized frame; dropping connection");
                        return ReadOutcome::Dead;
                    }
                    if msg_len > self.rx_buf.len() {
                        self.rx_buf.resize(msg_len, 0);
                    }
                    self.rx_state = RxState::ReadingPayload { msg_len, offset: 0 };
                }
                RxState::ReadingPayload { msg_len, mut offset } => {
                    while offset < msg_len {
                        match self.stream.read(&mut self.rx_buf[offset..msg_len]) {
                            Ok(0) => return ReadOutcome::Dead,
                            Ok(n) => {
                                offset += n;
                                self.last_recv = Instant::now();
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingPayload { msg_len, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                tracing::debug!(error=%err, "connection payload read failed");
                                return ReadOutcome::Dead;
                            }
                        }
                    }
                    self.rx_state = RxState::ReadingHeader {
                        buf: [0; LEN_HEADER_SIZE],
                        have: 0,
                    };
                    return ReadOutcome::Frame(self.rx_buf[..msg_len].to_vec());
                }
            }
        }
    }
}

enum ReadOutcome {
    Frame(Vec<u8>),
    WouldBlock,
    Dead,
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_sizes(stream: &TcpStream, send: usize, recv: usize) {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    unsafe {
        let send = send as libc::c_int;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &send as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let recv = recv as libc::c_int;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &recv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Drive a framed exchange over a real localhost socket pair.
    #[test]
    fn test_frames_roundtrip_over_socket_pair() {
        let mut poller = Poller::new().unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = listener.local_addr().unwrap();
        poller.subscribe(&mut listener, Token(0), Readiness::READ).unwrap();

        let out_stream = TcpStream::connect(local).unwrap();
        let mut out = TcpConnection::new(out_stream, Token(1), true, 4096);
        poller
            .subscribe(out.stream_mut(), Token(1), Readiness::READ_WRITE)
            .unwrap();

        let mut inbound: Option<TcpConnection> = None;
        let payload_a = vec![7u8; 3];
        let payload_b = vec![9u8; 70_000]; // Larger than the receive buffer.
        let mut sent = false;
        let mut got: Vec<Vec<u8>> = Vec::new();

        for _ in 0..500 {
            let events: Vec<_> = poller.poll(Duration::from_millis(10)).unwrap().to_vec();
            for ev in events {
                match ev.token {
                    Token(0) => {
                        if let Ok((stream, _)) = listener.accept() {
                            let mut conn = TcpConnection::new(stream, Token(2), false, 4096);
                            poller.subscribe(conn.stream_mut(), Token(2), Readiness::READ).unwrap();
                            inbound = Some(conn);
                        }
                    }
                    Token(1) => {
                        assert_eq!(out.handle_event(&poller, ev.readiness), ConnState::Alive);
                        if out.established && !sent {
                            assert_eq!(out.send(&poller, &payload_a), ConnState::Alive);
                            assert_eq!(out.send(&poller, &payload_b), ConnState::Alive);
                            sent = true;
                        }
                    }
                    Token(2) => {
                        let conn = inbound.as_mut().unwrap();
                        assert_eq!(conn.handle_event(&poller, ev.readiness), ConnState::Alive);
                        while let Some(frame) = conn.inbound.pop_front() {
                            got.push(frame);
                        }
                    }
                    _ => unreachable!(),
                }
            }
            if got.len() == 2 {
                break;
            }
        }

        assert_eq!(got.len(), 2, "expected both frames to arrive");
        assert_eq!(got[0], payload_a);
        assert_eq!(got[1], payload_b);
    }

    #[test]
    fn test_idle_detection() {
        let mut poller = Poller::new().unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = listener.local_addr().unwrap();
        poller.subscribe(&mut listener, Token(0), Readiness::READ).unwrap();

        let stream = TcpStream::connect(local).unwrap();
        let conn = TcpConnection::new(stream, Token(1), true, 1024);

        let now = Instant::now();
        assert!(!conn.is_idle(now, Duration::from_secs(5)));
        assert!(conn.is_idle(now + Duration::from_secs(6), Duration::from_secs(5)));
    }
}
