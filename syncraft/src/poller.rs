//! Single-threaded readiness demultiplexer over the node's sockets.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::Events;
use mio::Interest;
use mio::Poll;
pub use mio::Token;

/// The readiness mask observed for (or requested on) a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
    pub error: bool,
}

impl Readiness {
    pub const READ: Readiness = Readiness {
        read: true,
        write: false,
        error: false,
    };
    pub const WRITE: Readiness = Readiness {
        read: false,
        write: true,
        error: false,
    };
    pub const READ_WRITE: Readiness = Readiness {
        read: true,
        write: true,
        error: false,
    };

    fn interest(self) -> Interest {
        match (self.read, self.write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            // Error readiness is always delivered by the OS selector, so a
            // read-only interest is the baseline.
            _ => Interest::READABLE,
        }
    }
}

/// One ready descriptor reported by a `poll` call.
#[derive(Clone, Copy, Debug)]
pub struct PollEvent {
    pub token: Token,
    pub readiness: Readiness,
}

/// A readiness multiplexer over a set of registered sockets.
///
/// Each node owns exactly one `Poller`, created at construction and released
/// at destroy. All dispatch happens on the scheduler's thread: `poll` yields
/// each ready token at most once per call, and the caller routes the event
/// to the component owning that token.
pub struct Poller {
    poll: Poll,
    events: Events,
    ready: Vec<PollEvent>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            ready: Vec::with_capacity(256),
        })
    }

    /// Register a socket for readiness notifications under the given token.
    pub fn subscribe(&self, source: &mut impl Source, token: Token, mask: Readiness) -> io::Result<()> {
        self.poll.registry().register(source, token, mask.interest())
    }

    /// Change the readiness mask of an already registered socket.
    pub fn modify(&self, source: &mut impl Source, token: Token, mask: Readiness) -> io::Result<()> {
        self.poll.registry().reregister(source, token, mask.interest())
    }

    /// Remove a socket from the poller.
    pub fn unsubscribe(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block for up to `timeout` and collect the ready descriptors.
    ///
    /// A zero timeout makes the call non-blocking. Spurious wakeups with an
    /// empty result are normal.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<&[PollEvent]> {
        self.ready.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            // A signal may land while parked in the selector; report an
            // empty round and let the caller's next tick retry.
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(&self.ready),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            self.ready.push(PollEvent {
                token: event.token(),
                readiness: Readiness {
                    read: event.is_readable() || event.is_read_closed(),
                    write: event.is_writable(),
                    error: event.is_error() || event.is_read_closed() || event.is_write_closed(),
                },
            });
        }
        Ok(&self.ready)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::SocketAddr;

    use super::*;

    #[test]
    fn test_poller_reports_readable_listener() {
        let mut poller = Poller::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = mio::net::TcpListener::bind(addr).unwrap();
        let local = listener.local_addr().unwrap();
        poller.subscribe(&mut listener, Token(7), Readiness::READ).unwrap();

        let mut client = std::net::TcpStream::connect(local).unwrap();
        client.write_all(b"x").unwrap();

        // The accept readiness may take a moment to surface.
        let mut seen = false;
        for _ in 0..100 {
            let events = poller.poll(Duration::from_millis(20)).unwrap();
            if events.iter().any(|ev| ev.token == Token(7) && ev.readiness.read) {
                seen = true;
                break;
            }
        }
        assert!(seen, "listener never became readable");

        poller.unsubscribe(&mut listener).unwrap();
    }
}
