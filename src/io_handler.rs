/*!
 * I/O Handlers
 *
 * An I/O handler is an event loop thread with its own multiplexer and its
 * own set of client connections. Listener threads hand it sockets through
 * an [`IoHandlerHandle`]; the handler reads requests, sends each one to the
 * owning worker, waits for that single reply and writes it back.
 *
 * Each handler has at most one request in flight at a time. Other ready
 * connections are served once the current reply has been written into the
 * connection's output buffer.
 */

use crate::dispatch::Dispatcher;
use crate::lifecycle::Lifecycle;
use crate::multiplexer::{ErrorBackoff, Event, Interest, Multiplexer, Registrar};
use crate::protocol::{parse_many, Command, Reply};
use bytes::{Buf, BytesMut};
use hashbrown::HashMap;
use log::{debug, info, warn};
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Size of one socket read
const READ_BUF: usize = 4096;
/// Events drained per multiplexer wake-up
const EVENTS_PER_WAIT: usize = 1024;

/// What happened to a connection after servicing an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Open,
    Closed,
}

/// One client socket with its pending input and output
pub(crate) struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    rbuf: BytesMut,
    wbuf: BytesMut,
    cmds: Vec<Command>,
    write_interest: bool,
    /// Peer has half-closed; finish writing, then close
    eof: bool,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            rbuf: BytesMut::with_capacity(READ_BUF),
            wbuf: BytesMut::new(),
            cmds: Vec::with_capacity(32),
            write_interest: false,
            eof: false,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Service one readiness event
    ///
    /// Reads everything available, runs each complete request through
    /// `execute` in order, then flushes as much output as the socket takes.
    /// Requests that arrive together with the peer's half-close are still
    /// answered before the connection reports `Closed`. Orderly closes and
    /// resets come back as `Ok(Closed)`; any other I/O failure is returned
    /// for the caller to log before closing.
    pub(crate) fn on_event<F>(
        &mut self,
        ev: &Event,
        mux: &Multiplexer,
        mut execute: F,
    ) -> io::Result<ConnState>
    where
        F: FnMut(Command) -> Reply,
    {
        if ev.readable && !self.eof {
            match self.fill()? {
                Fill::Reset => return Ok(ConnState::Closed),
                Fill::Eof => self.eof = true,
                Fill::Drained => {}
            }
            self.run_requests(&mut execute);
        } else if ev.closed {
            return Ok(ConnState::Closed);
        }

        if !self.wbuf.is_empty() && self.flush()? == ConnState::Closed {
            return Ok(ConnState::Closed);
        }
        if self.eof && self.wbuf.is_empty() {
            return Ok(ConnState::Closed);
        }

        let want_write = !self.wbuf.is_empty();
        if want_write != self.write_interest {
            let interest = if want_write { Interest::ReadWrite } else { Interest::Read };
            mux.modify(self.fd(), interest)?;
            self.write_interest = want_write;
        }
        Ok(ConnState::Open)
    }

    /// Parse and execute every buffered request, encoding replies in order
    fn run_requests<F>(&mut self, execute: &mut F)
    where
        F: FnMut(Command) -> Reply,
    {
        loop {
            let parsed = parse_many(&mut self.rbuf, &mut self.cmds);
            for cmd in self.cmds.drain(..) {
                execute(cmd).encode(&mut self.wbuf);
            }
            let Err(e) = parsed else { return };

            debug!("protocol error from {}: {}", self.peer, e);
            Reply::error(format!("ERR {e}")).encode(&mut self.wbuf);
            if !e.is_recoverable() {
                // no way to resynchronize inside a broken frame
                self.rbuf.clear();
                return;
            }
        }
    }

    /// Read until the socket would block or the peer stops sending
    fn fill(&mut self) -> io::Result<Fill> {
        let mut tmp = [0u8; READ_BUF];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => self.rbuf.extend_from_slice(&tmp[..n]),
                Err(ref e) if would_block(e) => return Ok(Fill::Drained),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_disconnect(e) => return Ok(Fill::Reset),
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<ConnState> {
        while !self.wbuf.is_empty() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.wbuf.advance(n),
                Err(ref e) if would_block(e) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_disconnect(e) => return Ok(ConnState::Closed),
                Err(e) => return Err(e),
            }
        }
        Ok(ConnState::Open)
    }
}

/// Outcome of draining a socket's input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// Read until `WouldBlock`
    Drained,
    /// The peer closed its sending side
    Eof,
    /// The connection was reset
    Reset,
}

/// Check if an I/O error indicates the operation would block
#[inline]
pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Errors that just mean the client went away
#[inline]
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// State shared between a handler thread and the listeners feeding it
struct Shared {
    id: usize,
    conns: Mutex<HashMap<RawFd, Connection>>,
    registrar: Registrar,
    open: Arc<AtomicUsize>,
}

/// Cloneable entry point for handing connections to a handler
#[derive(Clone)]
pub struct IoHandlerHandle {
    shared: Arc<Shared>,
}

impl IoHandlerHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Adopt an accepted socket
    ///
    /// On error the socket has already been dropped, which closes it.
    pub fn add_conn(&self, stream: std::net::TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true).ok();
        let conn = Connection::new(TcpStream::from_std(stream), peer);
        let fd = conn.fd();

        // insert before watching so the first event always finds the connection
        let mut conns = self.shared.conns.lock();
        conns.insert(fd, conn);
        if let Err(e) = self.shared.registrar.monitor(fd, Interest::Read) {
            conns.remove(&fd);
            return Err(e);
        }
        self.shared.open.fetch_add(1, Ordering::AcqRel);
        debug!("io handler {} adopted {} (fd {})", self.shared.id, peer, fd);
        Ok(())
    }

    /// Connections currently owned by this handler
    pub fn len(&self) -> usize {
        self.shared.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct IoHandler {
    mux: Multiplexer,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<Lifecycle>,
}

impl IoHandler {
    /// Create a handler with a fresh multiplexer
    ///
    /// `open` is the process-wide count of live client connections.
    pub fn new(
        id: usize,
        dispatcher: Arc<Dispatcher>,
        lifecycle: Arc<Lifecycle>,
        open: Arc<AtomicUsize>,
    ) -> io::Result<Self> {
        let mux = Multiplexer::create(EVENTS_PER_WAIT)?;
        let registrar = mux.registrar()?;
        Ok(Self {
            mux,
            shared: Arc::new(Shared {
                id,
                conns: Mutex::new(HashMap::new()),
                registrar,
                open,
            }),
            dispatcher,
            lifecycle,
        })
    }

    pub fn handle(&self) -> IoHandlerHandle {
        IoHandlerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("io-handler-{}", self.shared.id))
            .spawn(move || self.run())
    }

    /// Event loop. Returns once shutdown has claimed this handler.
    pub fn run(mut self) {
        info!("I/O handler {} started", self.shared.id);
        let mut backoff = ErrorBackoff::new();
        loop {
            let events = match self.mux.wait(None) {
                Ok(events) => {
                    backoff.reset();
                    events
                }
                Err(e) => {
                    warn!("I/O handler {} wait failed: {}", self.shared.id, e);
                    backoff.sleep();
                    continue;
                }
            };
            let Some(_busy) = self.lifecycle.begin() else {
                break;
            };
            for ev in &events {
                self.service(ev);
            }
        }
        self.mux.close();
        info!("I/O handler {} stopped", self.shared.id);
    }

    fn service(&self, ev: &Event) {
        // take the connection out so the lock is not held while a worker runs
        let Some(mut conn) = self.shared.conns.lock().remove(&ev.fd) else {
            return;
        };

        let dispatcher = &self.dispatcher;
        let id = self.shared.id;
        let result = conn.on_event(ev, &self.mux, |cmd| {
            dispatcher.execute(cmd).unwrap_or_else(|e| {
                warn!("I/O handler {}: {}", id, e);
                Reply::error("ERR server is shutting down")
            })
        });

        match result {
            Ok(ConnState::Open) => {
                self.shared.conns.lock().insert(ev.fd, conn);
            }
            Ok(ConnState::Closed) => self.close(conn),
            Err(e) => {
                warn!("I/O error on {} (fd {}): {}", conn.peer(), ev.fd, e);
                self.close(conn);
            }
        }
    }

    fn close(&self, conn: Connection) {
        let _ = self.mux.unmonitor(conn.fd());
        self.shared.open.fetch_sub(1, Ordering::AcqRel);
        debug!("I/O handler {} closed {}", self.shared.id, conn.peer());
        // dropping the stream closes the socket
    }
}
