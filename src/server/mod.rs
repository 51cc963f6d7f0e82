//! TCP/TLS server with worker-pool admission control.
//!
//! The accept loop turns each accepted socket into a [`Connection`] and
//! submits it to a fixed [`WorkerPool`]. At most `workers` connections are
//! serviced at a time and up to `backlog` more wait in the pool's queue.
//! Beyond that the accept loop blocks, and new clients queue up in the
//! kernel until a worker frees up.

mod connection;
mod listener;
mod tls;
mod wait_group;

pub use connection::{CloseHandle, Connection};
pub use tls::{TlsError, TlsSettings};

use crate::pool::{PoolError, WorkerPool};
use crate::protocol::{ConnectionHandler, Protocol};
use connection::{Context, Stream};
use listener::Listener;
use mio::Waker;
use rustls::ServerConnection;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_group::WaitGroup;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Server construction parameters.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address to bind to, `host:port`.
    pub listen: String,
    /// Number of workers, i.e. concurrently serviced connections.
    pub workers: usize,
    /// Accepted connections allowed to wait for a worker.
    pub backlog: usize,
    /// Serve TLS instead of plain TCP.
    pub tls: Option<TlsSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3498".to_string(),
            workers: 5,
            backlog: 100,
            tls: None,
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to resolve '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("'{0}' did not resolve to any address")]
    NoAddress(String),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("server is already bound")]
    AlreadyBound,

    #[error("server is not bound")]
    NotBound,

    #[error("accept loop failed: {0}")]
    Poll(#[source] io::Error),
}

/// A bound listener waiting for `serve`.
struct Bound {
    listener: Listener,
    tls: Option<Arc<rustls::ServerConfig>>,
}

/// Server instance
pub struct Server {
    settings: Settings,
    context: Arc<Context>,
    pool: WorkerPool,
    bound: Mutex<Option<Bound>>,
    waker: Mutex<Option<Arc<Waker>>>,
    local_addr: OnceLock<SocketAddr>,
    stop: AtomicBool,
    /// Accepted connections plus the running accept loop.
    group: WaitGroup,
}

impl Server {
    /// Create a server and start its worker pool.
    pub fn new(
        settings: Settings,
        handler: Arc<dyn ConnectionHandler>,
        protocol: Arc<dyn Protocol>,
    ) -> Result<Self, ServerError> {
        let pool = WorkerPool::new(settings.workers, settings.backlog);
        pool.run()?;

        Ok(Server {
            settings,
            context: Arc::new(Context { protocol, handler }),
            pool,
            bound: Mutex::new(None),
            waker: Mutex::new(None),
            local_addr: OnceLock::new(),
            stop: AtomicBool::new(false),
            group: WaitGroup::new(),
        })
    }

    /// Resolve the address, load TLS material and start listening.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding to port 0.
    pub fn bind(&self) -> Result<SocketAddr, ServerError> {
        let mut bound = lock(&self.bound);
        if bound.is_some() || self.local_addr.get().is_some() {
            return Err(ServerError::AlreadyBound);
        }

        let addr = resolve(&self.settings.listen)?;
        let tls = self
            .settings
            .tls
            .as_ref()
            .map(TlsSettings::load)
            .transpose()?;

        let (listener, waker) =
            Listener::bind(addr).map_err(|source| ServerError::Listen { addr, source })?;
        let local_addr = listener.local_addr();

        info!(
            address = %local_addr,
            tls = tls.is_some(),
            workers = self.pool.worker_count(),
            backlog = self.pool.capacity(),
            "Server listening"
        );

        *lock(&self.waker) = Some(waker);
        let _ = self.local_addr.set(local_addr);
        *bound = Some(Bound { listener, tls });
        Ok(local_addr)
    }

    /// Run the accept loop on the calling thread until [`Server::stop`].
    pub fn serve(&self) -> Result<(), ServerError> {
        if self.stopping() {
            return Ok(());
        }

        let Bound { mut listener, tls } = lock(&self.bound).take().ok_or(ServerError::NotBound)?;
        let _ticket = self.group.enter();

        'serve: while !self.stopping() {
            if let Err(e) = listener.wait() {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if self.stopping() {
                    break;
                }
                return Err(ServerError::Poll(e));
            }

            loop {
                if self.stopping() {
                    break 'serve;
                }

                match listener.accept() {
                    Ok((sock, peer)) => self.admit(sock, peer, tls.as_ref()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        thread::sleep(ACCEPT_BACKOFF);
                    }
                }
            }
        }

        info!(address = %listener.local_addr(), "Accept loop stopped");
        Ok(())
    }

    /// Bind and serve. Blocks until the server is stopped.
    pub fn start(&self) -> Result<(), ServerError> {
        self.bind()?;
        self.serve()
    }

    /// Stop accepting, drain the pool and wait for every connection to end.
    ///
    /// Connections already being serviced are not interrupted. Safe to call
    /// more than once and from several threads.
    pub fn stop(&self) {
        let first = !self.stop.swap(true, Ordering::AcqRel);

        if first {
            info!("Stopping server");
            if let Some(waker) = lock(&self.waker).as_ref() {
                if let Err(e) = waker.wake() {
                    warn!(error = %e, "Failed to wake accept loop");
                }
            }
            // Bound but never served.
            drop(lock(&self.bound).take());
        }

        self.pool.stop();
        self.group.wait();

        if first {
            info!("Server stopped");
        }
    }

    /// Address the listener is bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Wrap an accepted socket and hand it to the pool.
    ///
    /// Blocks while the pool's backlog is full.
    fn admit(&self, sock: TcpStream, peer: SocketAddr, tls: Option<&Arc<rustls::ServerConfig>>) {
        let stream = match tls {
            None => Stream::plain(sock),
            Some(config) => match ServerConnection::new(Arc::clone(config)) {
                Ok(session) => Stream::tls(session, sock),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to create TLS session");
                    return;
                }
            },
        };

        let conn = Connection::new(stream, peer, Arc::clone(&self.context), self.group.enter());
        debug!(peer = %conn.remote_addr_string(), "Accepted connection");

        if let Err(e) = self.pool.handle(conn) {
            debug!(peer = %peer, error = %e, "Connection dropped");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve(listen: &str) -> Result<SocketAddr, ServerError> {
    listen
        .to_socket_addrs()
        .map_err(|source| ServerError::Resolve {
            addr: listen.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ServerError::NoAddress(listen.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
