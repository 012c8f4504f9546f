//! The passive listening socket accepting inbound peer connections.

use std::io;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;

use mio::net::TcpListener;
use mio::net::TcpStream;

use crate::poller::Poller;
use crate::poller::Readiness;
use crate::poller::Token;
use crate::raft_types::NodeAddress;
use crate::transport::connection::set_socket_buf_sizes;

/// The passive socket bound to this node's own address.
pub(crate) struct TcpServer {
    listener: TcpListener,
    token: Token,
}

impl TcpServer {
    /// Resolve `addr` and bind a non-blocking listener on it.
    pub(crate) fn bind(poller: &Poller, addr: &NodeAddress, token: Token) -> io::Result<Self> {
        let sock_addr = resolve(addr)?;
        let mut listener = TcpListener::bind(sock_addr)?;
        poller.subscribe(&mut listener, token, Readiness::READ)?;
        Ok(Self { listener, token })
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    /// Accept all pending connections, applying the peer socket options.
    pub(crate) fn accept_pending(
        &mut self,
        send_buffer_size: usize,
        recv_buffer_size: usize,
    ) -> Vec<(TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    set_socket_buf_sizes(&stream, send_buffer_size, recv_buffer_size);
                    accepted.push((stream, addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!(error=%err, "accept failed");
                    break;
                }
            }
        }
        accepted
    }

    pub(crate) fn close(&mut self, poller: &Poller) {
        let _ = poller.unsubscribe(&mut self.listener);
    }
}

/// Resolve a node address to a concrete socket address.
pub(crate) fn resolve(addr: &NodeAddress) -> io::Result<SocketAddr> {
    (addr.host.as_str(), addr.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve {}", addr)))
}
