//! Listening socket with a wake-up channel.
//!
//! The socket is non-blocking and registered with a mio [`Poll`] next to a
//! [`Waker`]. The accept loop sleeps in the poller, so `stop` can interrupt
//! it from another thread without closing the descriptor underneath it.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Kernel backlog for not-yet-accepted connections.
const LISTEN_BACKLOG: i32 = 1024;

pub(crate) struct Listener {
    socket: TcpListener,
    poll: Poll,
    events: Events,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind and listen on `addr`. The returned waker interrupts [`Listener::wait`].
    pub(crate) fn bind(addr: SocketAddr) -> io::Result<(Self, Arc<Waker>)> {
        let socket = create_listener(addr)?;
        let local_addr = socket.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let listener = Self {
            socket,
            poll,
            events: Events::with_capacity(8),
            local_addr,
        };
        Ok((listener, waker))
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until a connection is pending or the waker fires.
    pub(crate) fn wait(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, None)
    }

    /// Accept one pending connection as a blocking stream.
    ///
    /// Returns `WouldBlock` once the pending queue is empty.
    pub(crate) fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.socket.accept()?;
        // Some platforms inherit O_NONBLOCK from the listener.
        stream.set_nonblocking(false)?;
        Ok((stream, peer))
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
