//! Peer transport: one logical message channel per cluster member.

mod connection;
mod server;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use mio::net::TcpStream;

use crate::config::Config;
use crate::poller::Poller;
use crate::poller::Readiness;
use crate::poller::Token;
use crate::raft::Message;
use crate::raft_types::MessageSummary;
use crate::raft_types::NodeAddress;
use crate::transport::connection::ConnState;
use crate::transport::connection::set_socket_buf_sizes;
use crate::transport::connection::TcpConnection;
use crate::transport::server::resolve;
use crate::transport::server::TcpServer;

const SERVER_TOKEN: Token = Token(0);

/// Initial redial delay after losing a peer connection.
const DIAL_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
/// Redial delay ceiling.
const DIAL_BACKOFF_MAX: Duration = Duration::from_millis(1000);

/// Per-peer channel bookkeeping.
struct PeerChannel {
    /// The connection currently carrying this peer's traffic, if any.
    token: Option<Token>,
    next_dial: Instant,
    backoff: Duration,
}

/// Maintains one logical channel per cluster peer, hiding connects,
/// reconnects and framing from the Raft core.
///
/// Identity is exchanged, not inferred: the dialing side's first frame is
/// always `Hello{node_address}`, which lets the accepting side bind the
/// socket to a peer. When both sides dial simultaneously the duplicate is
/// resolved deterministically: the lexicographically smaller address keeps
/// its outbound socket.
pub(crate) struct Transport {
    id: NodeAddress,
    config: Arc<Config>,
    server: TcpServer,
    conns: HashMap<Token, TcpConnection>,
    peers: BTreeMap<NodeAddress, PeerChannel>,
    next_token: usize,
}

impl Transport {
    /// Bind the node's listening socket and prepare channels for each peer.
    pub(crate) fn new(
        poller: &Poller,
        id: NodeAddress,
        peer_addrs: impl IntoIterator<Item = NodeAddress>,
        config: Arc<Config>,
    ) -> io::Result<Self> {
        let server = TcpServer::bind(poller, &id, SERVER_TOKEN)?;
        let now = Instant::now();
        let peers = peer_addrs
            .into_iter()
            .filter(|p| p != &id)
            .map(|p| {
                (
                    p,
                    PeerChannel {
                        token: None,
                        next_dial: now,
                        backoff: DIAL_BACKOFF_INITIAL,
                    },
                )
            })
            .collect();
        Ok(Self {
            id,
            config,
            server,
            conns: HashMap::new(),
            peers,
            next_token: 1,
        })
    }

    /// Drain the poller and return every whole inbound message, attributed
    /// to the peer that sent it.
    pub(crate) fn poll_io(&mut self, poller: &mut Poller, max_wait: Duration) -> Vec<(NodeAddress, Message)> {
        let events = match poller.poll(max_wait) {
            Ok(events) => events.to_vec(),
            Err(err) => {
                tracing::error!(error=%err, "poll failed");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for ev in events {
            if ev.token == self.server.token() {
                self.accept_pending(poller);
                continue;
            }

            // The connection may have been closed earlier in this batch.
            let (state, frames) = match self.conns.get_mut(&ev.token) {
                Some(conn) => {
                    let state = conn.handle_event(poller, ev.readiness);
                    let frames: Vec<Vec<u8>> = conn.inbound.drain(..).collect();
                    (state, frames)
                }
                None => continue,
            };

            // Whole frames that arrived ahead of a disconnect still count.
            for frame in frames {
                if !self.conns.contains_key(&ev.token) {
                    break;
                }
                self.process_frame(poller, ev.token, &frame, &mut out);
            }
            if state == ConnState::Dead {
                self.close_conn(poller, ev.token);
            }
        }
        out
    }

    /// Advance connection-idle timers and the per-peer dial schedule.
    pub(crate) fn advance_timers(&mut self, poller: &Poller, now: Instant) {
        let idle: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.is_idle(now, self.config.connection_timeout))
            .map(|(token, _)| *token)
            .collect();
        for token in idle {
            tracing::debug!(?token, "closing idle connection");
            self.close_conn(poller, token);
        }

        let due: Vec<NodeAddress> = self
            .peers
            .iter()
            .filter(|(_, chan)| chan.token.is_none() && now >= chan.next_dial)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in due {
            self.dial(poller, &addr, now);
        }
    }

    /// Send a message to a peer. Messages to disconnected peers are silently
    /// dropped; Raft's retries tolerate the loss.
    pub(crate) fn send(&mut self, poller: &Poller, target: &NodeAddress, msg: &Message) {
        let token = match self.peers.get(target).and_then(|chan| chan.token) {
            Some(token) => token,
            None => {
                tracing::trace!(target=%target, msg=%msg.summary(), "dropping message to disconnected peer");
                return;
            }
        };
        let body = match bincode::serialize(msg) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error=%err, "message encode failed");
                return;
            }
        };
        let dead = match self.conns.get_mut(&token) {
            Some(conn) => conn.send(poller, &body) == ConnState::Dead,
            None => false,
        };
        if dead {
            self.close_conn(poller, token);
        }
    }

    /// Whether a live channel to the peer currently exists.
    pub(crate) fn is_connected(&self, peer: &NodeAddress) -> bool {
        self.peers.get(peer).map(|chan| chan.token.is_some()).unwrap_or(false)
    }

    /// Close every socket. The transport is unusable afterwards.
    pub(crate) fn shutdown(&mut self, poller: &Poller) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close_conn(poller, token);
        }
        self.server.close(poller);
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept_pending(&mut self, poller: &Poller) {
        for (stream, addr) in self
            .server
            .accept_pending(self.config.send_buffer_size, self.config.recv_buffer_size)
        {
            let token = self.alloc_token();
            let mut conn = TcpConnection::new(stream, token, false, self.config.recv_buffer_size);
            if let Err(err) = poller.subscribe(conn.stream_mut(), token, Readiness::READ) {
                tracing::warn!(error=%err, "failed to register accepted connection");
                continue;
            }
            tracing::debug!(from=%addr, ?token, "accepted connection");
            self.conns.insert(token, conn);
        }
    }

    fn dial(&mut self, poller: &Poller, peer: &NodeAddress, now: Instant) {
        let result = resolve(peer).and_then(TcpStream::connect);
        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(peer=%peer, error=%err, "dial failed");
                self.schedule_redial(peer, now, false);
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        set_socket_buf_sizes(&stream, self.config.send_buffer_size, self.config.recv_buffer_size);

        let token = self.alloc_token();
        let mut conn = TcpConnection::new(stream, token, true, self.config.recv_buffer_size);
        conn.peer = Some(peer.clone());
        if let Err(err) = poller.subscribe(conn.stream_mut(), token, Readiness::READ_WRITE) {
            tracing::warn!(error=%err, "failed to register outbound connection");
            self.schedule_redial(peer, now, false);
            return;
        }

        // Introduce ourselves; the frame sits in the backlog until the TCP
        // handshake completes.
        let hello = Message::Hello {
            node_address: self.id.clone(),
        };
        let body = bincode::serialize(&hello).expect("hello message must encode");
        if conn.send(poller, &body) == ConnState::Dead {
            conn.close(poller);
            self.schedule_redial(peer, now, false);
            return;
        }

        tracing::debug!(peer=%peer, ?token, "dialing");
        self.conns.insert(token, conn);
        if let Some(chan) = self.peers.get_mut(peer) {
            chan.token = Some(token);
        }
    }

    fn schedule_redial(&mut self, peer: &NodeAddress, now: Instant, had_worked: bool) {
        if let Some(chan) = self.peers.get_mut(peer) {
            if had_worked {
                chan.backoff = DIAL_BACKOFF_INITIAL;
            } else {
                chan.backoff = std::cmp::min(chan.backoff * 2, DIAL_BACKOFF_MAX);
            }
            chan.next_dial = now + chan.backoff;
        }
    }

    fn close_conn(&mut self, poller: &Poller, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            conn.close(poller);
            if let Some(peer) = conn.peer.clone() {
                let bound_here = self.peers.get(&peer).and_then(|chan| chan.token) == Some(token);
                if bound_here {
                    tracing::debug!(peer=%peer, "peer disconnected");
                    self.schedule_redial(&peer, Instant::now(), conn.established);
                    if let Some(chan) = self.peers.get_mut(&peer) {
                        chan.token = None;
                    }
                }
            }
        }
    }

    fn process_frame(
        &mut self,
        poller: &Poller,
        token: Token,
        frame: &[u8],
        out: &mut Vec<(NodeAddress, Message)>,
    ) {
        let msg: Message = match bincode::deserialize(frame) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error=%err, "undecodable frame; dropping connection");
                self.close_conn(poller, token);
                return;
            }
        };

        let bound = self.conns.get(&token).and_then(|conn| conn.peer.clone());
        match (bound, msg) {
            (None, Message::Hello { node_address }) => {
                self.bind_peer(poller, token, node_address);
            }
            (None, msg) => {
                tracing::warn!(msg=%msg.summary(), "message before Hello; dropping connection");
                self.close_conn(poller, token);
            }
            (Some(peer), Message::Hello { node_address }) => {
                // A Hello is only expected as the first frame of a dialed
                // connection; anything else is a protocol violation.
                if node_address != peer {
                    tracing::warn!(peer=%peer, claimed=%node_address, "conflicting Hello; dropping connection");
                    self.close_conn(poller, token);
                }
            }
            (Some(peer), msg) => out.push((peer, msg)),
        }
    }

    /// Bind a freshly introduced inbound connection to its peer, resolving
    /// any duplicate channel deterministically.
    fn bind_peer(&mut self, poller: &Poller, token: Token, peer: NodeAddress) {
        if peer == self.id || !self.peers.contains_key(&peer) {
            tracing::warn!(claimed=%peer, "Hello from unknown address; dropping connection");
            self.close_conn(poller, token);
            return;
        }

        let existing = self.peers.get(&peer).and_then(|chan| chan.token);
        if let Some(existing) = existing {
            let keep_existing = self
                .conns
                .get(&existing)
                .map(|conn| conn.outbound && self.id < peer)
                .unwrap_or(false);
            if keep_existing {
                // Smaller address keeps its outbound socket; drop the
                // duplicate without disturbing the bound channel.
                tracing::debug!(peer=%peer, "duplicate connection; keeping outbound socket");
                if let Some(mut conn) = self.conns.remove(&token) {
                    conn.close(poller);
                }
                return;
            }
            tracing::debug!(peer=%peer, "duplicate connection; adopting inbound socket");
            if let Some(mut conn) = self.conns.remove(&existing) {
                conn.close(poller);
            }
        }

        if let Some(conn) = self.conns.get_mut(&token) {
            conn.peer = Some(peer.clone());
        }
        if let Some(chan) = self.peers.get_mut(&peer) {
            chan.token = Some(token);
            chan.backoff = DIAL_BACKOFF_INITIAL;
        }
        tracing::debug!(peer=%peer, ?token, "peer connected");
    }
}
