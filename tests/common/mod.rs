//! Shared helpers for integration tests.

#![allow(dead_code)]

use portcullis::{ConnectionHandler, Connection, Packet, Protocol, Server, Settings};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Generous upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// A server running its accept loop on a background thread.
pub struct Running {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    accept_loop: Option<JoinHandle<()>>,
}

impl Running {
    pub fn start(
        workers: usize,
        backlog: usize,
        handler: Arc<dyn ConnectionHandler>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        Self::with_settings(
            Settings {
                listen: "127.0.0.1:0".to_string(),
                workers,
                backlog,
                tls: None,
            },
            handler,
            protocol,
        )
    }

    pub fn with_settings(
        settings: Settings,
        handler: Arc<dyn ConnectionHandler>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        let server = Arc::new(Server::new(settings, handler, protocol).unwrap());
        let addr = server.bind().unwrap();

        let s = Arc::clone(&server);
        let accept_loop = thread::spawn(move || s.serve().unwrap());

        Self {
            server,
            addr,
            accept_loop: Some(accept_loop),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(PATIENCE)).unwrap();
        stream
    }

    /// Stop the server and wait for the accept loop to exit.
    pub fn stop(mut self) {
        self.server.stop();
        if let Some(handle) = self.accept_loop.take() {
            handle.join().unwrap();
        }
    }
}

/// Lifecycle events seen by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Accepted(String),
    Message(Vec<u8>),
    Timeout,
    Closed(String),
}

/// Echo handler that counts and reports every callback.
pub struct Recorder {
    accept: bool,
    read_timeout: Option<Duration>,
    events: Mutex<Sender<Event>>,
    pub accepted: AtomicUsize,
    pub messages: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub closed: AtomicUsize,
    pub secure: Mutex<Vec<bool>>,
}

impl Recorder {
    pub fn new(accept: bool, read_timeout: Option<Duration>) -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Self {
            accept,
            read_timeout,
            events: Mutex::new(tx),
            accepted: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            secure: Mutex::new(Vec::new()),
        });
        (recorder, rx)
    }

    fn report(&self, event: Event) {
        // The test may have stopped listening.
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl ConnectionHandler for Recorder {
    fn on_accept(&self, conn: &mut Connection) -> bool {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.secure.lock().unwrap().push(conn.is_secure());
        conn.set_read_timeout(self.read_timeout).unwrap();
        self.report(Event::Accepted(conn.remote_addr_string()));
        self.accept
    }

    fn on_message(&self, conn: &mut Connection, packet: Box<dyn Packet>) -> bool {
        self.messages.fetch_add(1, Ordering::SeqCst);
        let data = packet.serialize();
        self.report(Event::Message(data.to_vec()));
        conn.write_all(&data).is_ok()
    }

    fn on_timeout(&self, _conn: &mut Connection) -> bool {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        self.report(Event::Timeout);
        false
    }

    fn on_close(&self, conn: &Connection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.report(Event::Closed(conn.remote_addr_string()));
    }
}

/// Next `Accepted` event, skipping others.
pub fn next_accept(events: &Receiver<Event>, timeout: Duration) -> Option<String> {
    loop {
        match events.recv_timeout(timeout) {
            Ok(Event::Accepted(peer)) => return Some(peer),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}
