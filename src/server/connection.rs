//! One accepted client socket and its read loop.
//!
//! A connection is a [`Job`]: the worker that picks it up drives it from
//! `on_accept` until it closes. The read loop peeks a single byte before
//! handing control to the protocol, so timeouts and end-of-stream are seen
//! without consuming anything the protocol would frame.

use super::wait_group::Ticket;
use crate::pool::Job;
use crate::protocol::{ConnectionHandler, Protocol};
use rustls::{ServerConnection, StreamOwned};
use std::cell::Cell;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 8 * 1024;

/// Shortest timeout handed to the socket while a deadline is still ahead.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Server-level collaborators shared by every connection.
pub(crate) struct Context {
    pub(crate) protocol: Arc<dyn Protocol>,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
}

/// TCP socket enforcing absolute read and write deadlines.
///
/// The remaining time is recomputed before every read and write syscall, so
/// a peer trickling bytes cannot stretch an operation past its deadline.
pub(crate) struct Socket {
    tcp: TcpStream,
    read_deadline: Cell<Option<Instant>>,
    write_deadline: Cell<Option<Instant>>,
}

impl Socket {
    fn new(tcp: TcpStream) -> Self {
        Self {
            tcp,
            read_deadline: Cell::new(None),
            write_deadline: Cell::new(None),
        }
    }
}

/// Apply the time left until `deadline` as the socket's timeout.
fn arm(
    tcp: &TcpStream,
    deadline: Option<Instant>,
    set: fn(&TcpStream, Option<Duration>) -> io::Result<()>,
) -> io::Result<()> {
    let Some(deadline) = deadline else {
        return Ok(());
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"));
    }
    set(tcp, Some(remaining.max(MIN_TIMEOUT)))
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        arm(&self.tcp, self.read_deadline.get(), TcpStream::set_read_timeout)?;
        self.tcp.read(buf)
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        arm(&self.tcp, self.write_deadline.get(), TcpStream::set_write_timeout)?;
        self.tcp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tcp.flush()
    }
}

/// Byte stream under a connection.
pub(crate) enum Stream {
    Plain(Socket),
    Tls(Box<StreamOwned<ServerConnection, Socket>>),
}

impl Stream {
    pub(crate) fn plain(sock: TcpStream) -> Self {
        Stream::Plain(Socket::new(sock))
    }

    pub(crate) fn tls(conn: ServerConnection, sock: TcpStream) -> Self {
        Stream::Tls(Box::new(StreamOwned::new(conn, Socket::new(sock))))
    }

    fn socket(&self) -> &Socket {
        match self {
            Stream::Plain(sock) => sock,
            Stream::Tls(tls) => &tls.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(sock) => sock.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

#[derive(Default)]
struct CloseState {
    /// Close signal checked at the top of every read loop iteration.
    closing: AtomicBool,
    /// One-shot guard for the terminal close action.
    closed: AtomicBool,
    /// Set by whoever shuts the socket down first.
    shut: AtomicBool,
}

impl CloseState {
    /// Shut `sock` down unless that already happened. Returns whether this
    /// call did it.
    fn shutdown(&self, sock: &TcpStream) -> bool {
        if self.shut.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = sock.shutdown(Shutdown::Both) {
            // Already torn down by the peer.
            trace!(error = %e, "Socket shutdown");
        }
        true
    }
}

/// An accepted client connection.
pub struct Connection {
    reader: BufReader<Stream>,
    peer: SocketAddr,
    state: Arc<CloseState>,
    context: Arc<Context>,
    /// Keeps the server's wait group raised until the connection is dropped.
    _ticket: Ticket,
}

impl Connection {
    pub(crate) fn new(
        stream: Stream,
        peer: SocketAddr,
        context: Arc<Context>,
        ticket: Ticket,
    ) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, stream),
            peer,
            state: Arc::new(CloseState::default()),
            context,
            _ticket: ticket,
        }
    }

    /// Whether the socket is TLS-wrapped.
    pub fn is_secure(&self) -> bool {
        matches!(self.reader.get_ref(), Stream::Tls(_))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Peer address prefixed by its scheme, e.g. `tcp:127.0.0.1:50122`.
    pub fn remote_addr_string(&self) -> String {
        let scheme = if self.is_secure() { "ssl" } else { "tcp" };
        format!("{scheme}:{}", self.peer)
    }

    /// Whether closing has been signalled.
    pub fn is_closed(&self) -> bool {
        self.state.closing.load(Ordering::Acquire)
    }

    /// Fail reads that would complete after `deadline`. `None` blocks
    /// indefinitely.
    ///
    /// The deadline is a fixed point in time covering every later read,
    /// partial ones included, until it is set again. Once it has passed,
    /// reads fail with [`io::ErrorKind::TimedOut`] without touching the
    /// socket.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let socket = self.socket();
        socket.read_deadline.set(deadline);
        if deadline.is_none() {
            socket.tcp.set_read_timeout(None)?;
        }
        Ok(())
    }

    /// Fail writes that would complete after `deadline`. `None` blocks
    /// indefinitely.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let socket = self.socket();
        socket.write_deadline.set(deadline);
        if deadline.is_none() {
            socket.tcp.set_write_timeout(None)?;
        }
        Ok(())
    }

    /// Set both the read and the write deadline.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    /// Bound each blocking read by `timeout`. Clears any read deadline.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let socket = self.socket();
        socket.read_deadline.set(None);
        socket.tcp.set_read_timeout(timeout.map(|t| t.max(MIN_TIMEOUT)))
    }

    /// Bound each blocking write by `timeout`. Clears any write deadline.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let socket = self.socket();
        socket.write_deadline.set(None);
        socket.tcp.set_write_timeout(timeout.map(|t| t.max(MIN_TIMEOUT)))
    }

    /// A handle that can request closure from another thread.
    pub fn close_handle(&self) -> io::Result<CloseHandle> {
        Ok(CloseHandle {
            state: Arc::clone(&self.state),
            socket: Arc::new(self.tcp().try_clone()?),
        })
    }

    /// Close the connection.
    ///
    /// Runs once no matter how many times it is called: signals closure,
    /// notifies the handler, then shuts the socket down unless a
    /// [`CloseHandle`] already did.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.state.closing.store(true, Ordering::Release);
        self.context.handler.on_close(self);
        self.state.shutdown(self.tcp());

        debug!(peer = %self.remote_addr_string(), "Connection closed");
    }

    fn socket(&self) -> &Socket {
        self.reader.get_ref().socket()
    }

    fn tcp(&self) -> &TcpStream {
        &self.socket().tcp
    }

    /// Full lifetime of the connection: accept, read loop, close.
    ///
    /// A panicking handler still gets its `on_close`; the panic is then
    /// passed on to the worker.
    fn serve(&mut self) {
        let handler = Arc::clone(&self.context.handler);

        debug!(peer = %self.remote_addr_string(), "Connection started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if handler.on_accept(self) {
                self.read_loop(&*handler);
            }
        }));

        self.close();

        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }

    fn read_loop(&mut self, handler: &dyn ConnectionHandler) {
        let protocol = Arc::clone(&self.context.protocol);

        loop {
            if self.is_closed() {
                return;
            }

            match self.reader.fill_buf().map(|buf| buf.is_empty()) {
                Ok(false) => {}
                Ok(true) => {
                    trace!(peer = %self.peer, "End of stream");
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    if handler.on_timeout(self) {
                        continue;
                    }
                    trace!(peer = %self.peer, "Timed out");
                    return;
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Read error");
                    return;
                }
            }

            let packet = match protocol.read_packet(self) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Framing error");
                    return;
                }
            };

            if !handler.on_message(self, packet) {
                return;
            }
        }
    }
}

impl Job for Connection {
    fn run(self: Box<Self>) {
        let mut conn = *self;
        conn.serve();
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for Connection {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

/// Every write is flushed before returning.
impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.reader.get_mut();
        let n = stream.write(buf)?;
        stream.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.reader.get_mut().flush()
    }
}

/// Requests that a connection close, from any thread.
///
/// The socket is shut down immediately, which unblocks a pending read; the
/// worker driving the connection then performs the close.
#[derive(Clone)]
pub struct CloseHandle {
    state: Arc<CloseState>,
    socket: Arc<TcpStream>,
}

impl CloseHandle {
    pub fn close(&self) {
        if self.state.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.shutdown(&self.socket);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closing.load(Ordering::Acquire)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
