/*!
 * Network Layer and Server Wiring
 *
 * Binds the listening sockets and assembles the engine in one of two shapes:
 *
 * - multi-threaded: listener threads accept and hand connections round-robin
 *   to I/O handlers, which route requests to shard-owning workers;
 * - single-threaded: one multiplexer loop accepts, reads, executes and runs
 *   active expiration itself.
 *
 * Both shapes register their lifecycles with one [`ShutdownCoordinator`].
 */

use crate::commands::CommandRegistry;
use crate::config::{Config, Mode};
use crate::dispatch::Dispatcher;
use crate::io_handler::{would_block, ConnState, Connection, IoHandler, IoHandlerHandle};
use crate::lifecycle::{Lifecycle, ShutdownCoordinator};
use crate::multiplexer::{ErrorBackoff, Interest, Multiplexer};
use crate::shard::{spawn_worker, Shard};
use crate::storage::{KeyspaceStats, Store};
use anyhow::{bail, Context, Result};
use crossbeam::channel::bounded;
use hashbrown::HashMap;
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sent to a client that connects while the server is full
const MAX_CLIENTS_REPLY: &[u8] = b"-ERR max number of clients reached\r\n";
/// Pending-connection backlog per listening socket
const BACKLOG: i32 = 1024;

/// Bind a TCP listener with SO_REUSEPORT support
///
/// Uses socket2 to set SO_REUSEPORT, allowing multiple listeners to bind
/// to the same port and share the incoming connection load (kernel load balancing).
pub fn bind_reuseport(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// A bound but not yet running server
pub struct Server {
    config: Config,
    listeners: Vec<TcpListener>,
    local_addr: SocketAddr,
    registry: Arc<CommandRegistry>,
    stats: Arc<KeyspaceStats>,
    coordinator: Arc<ShutdownCoordinator>,
    io_lifecycles: Vec<Arc<Lifecycle>>,
    worker_lifecycles: Vec<Arc<Lifecycle>>,
}

impl Server {
    /// Validate `config` and bind every listening socket
    ///
    /// With port 0 the first listener picks the port and the others share it.
    pub fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        let listener_count = match config.mode {
            Mode::Multi => config.listeners,
            Mode::Single => 1,
        };
        let first = bind_reuseport(config.addr())
            .with_context(|| format!("cannot bind {}", config.addr()))?;
        let local_addr = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..listener_count {
            listeners.push(
                bind_reuseport(local_addr)
                    .with_context(|| format!("cannot bind {}", local_addr))?,
            );
        }

        let (io_lifecycles, worker_lifecycles): (Vec<Arc<Lifecycle>>, Vec<Arc<Lifecycle>>) = match config.mode {
            Mode::Multi => (
                (0..config.io_handlers)
                    .map(|i| Arc::new(Lifecycle::new(format!("io-handler-{i}"))))
                    .collect(),
                (0..config.workers)
                    .map(|i| Arc::new(Lifecycle::new(format!("worker-{i}"))))
                    .collect(),
            ),
            Mode::Single => (vec![Arc::new(Lifecycle::new("event-loop"))], Vec::new()),
        };
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.add_stage(io_lifecycles.clone());
        coordinator.add_stage(worker_lifecycles.clone());

        info!("{:?} mode server bound to {}", config.mode, local_addr);
        Ok(Self {
            config,
            listeners,
            local_addr,
            registry: Arc::new(CommandRegistry::with_builtins()),
            stats: Arc::new(KeyspaceStats::default()),
            coordinator: Arc::new(coordinator),
            io_lifecycles,
            worker_lifecycles,
        })
    }

    /// Replace the command table, e.g. to add extension commands
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<KeyspaceStats> {
        self.stats.clone()
    }

    /// Handle used to stop the server gracefully
    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        self.coordinator.clone()
    }

    /// Run until the process exits
    pub fn run(self) -> Result<()> {
        match self.config.mode {
            Mode::Multi => self.run_multi(),
            Mode::Single => self.run_single(),
        }
    }

    fn run_multi(self) -> Result<()> {
        let cfg = &self.config;
        info!(
            "starting {} listeners, {} I/O handlers, {} workers",
            self.listeners.len(),
            cfg.io_handlers,
            cfg.workers
        );

        let mut queues = Vec::with_capacity(cfg.workers);
        for (id, lifecycle) in self.worker_lifecycles.iter().enumerate() {
            let (tx, rx) = bounded(cfg.queue_capacity);
            let store = Store::new(cfg.store, self.stats.clone());
            let shard = Shard::new(id, store, self.registry.clone());
            spawn_worker(shard, rx, lifecycle.clone(), cfg.active_expire_frequency)
                .context("cannot spawn worker")?;
            queues.push(tx);
        }
        let dispatcher = Arc::new(Dispatcher::new(queues));

        let open = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(cfg.io_handlers);
        for (id, lifecycle) in self.io_lifecycles.iter().enumerate() {
            let handler = IoHandler::new(id, dispatcher.clone(), lifecycle.clone(), open.clone())
                .with_context(|| format!("cannot create multiplexer for I/O handler {id}"))?;
            handles.push(handler.handle());
            handler.spawn().context("cannot spawn I/O handler")?;
        }
        let handles: Arc<[IoHandlerHandle]> = handles.into();

        let next = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::with_capacity(self.listeners.len());
        for (id, listener) in self.listeners.into_iter().enumerate() {
            let pool = ListenerPool {
                handlers: handles.clone(),
                next: next.clone(),
                open: open.clone(),
                max_connections: cfg.max_connections,
            };
            threads.push(pool.spawn(id, listener)?);
        }

        for t in threads {
            if t.join().is_err() {
                error!("listener thread panicked");
            }
        }
        Ok(())
    }

    fn run_single(self) -> Result<()> {
        let Some(lifecycle) = self.io_lifecycles.first().cloned() else {
            bail!("single-threaded mode needs an event loop lifecycle");
        };
        let Some(listener) = self.listeners.into_iter().next() else {
            bail!("no listening socket");
        };
        let store = Store::new(self.config.store, self.stats.clone());
        let shard = Shard::new(0, store, self.registry.clone());

        let event_loop = EventLoop {
            listener,
            mux: Multiplexer::create(1024).context("cannot create multiplexer")?,
            conns: HashMap::new(),
            shard,
            lifecycle,
            max_connections: self.config.max_connections,
            expire_every: self.config.active_expire_frequency,
        };
        event_loop.run()
    }
}

/// Accept loop state shared by every listener thread
struct ListenerPool {
    handlers: Arc<[IoHandlerHandle]>,
    next: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ListenerPool {
    fn spawn(self, id: usize, listener: TcpListener) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name(format!("listener-{id}"))
            .spawn(move || {
                info!("listener {} accepting on {:?}", id, listener.local_addr());
                let mut backoff = ErrorBackoff::new();
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            backoff.reset();
                            self.assign(stream, peer);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!("listener {} accept error: {}", id, e);
                            // e.g. EMFILE: give the process a moment to free descriptors
                            backoff.sleep();
                        }
                    }
                }
            })
            .context("cannot spawn listener")?;
        Ok(handle)
    }

    /// Hand a new connection to the next handler in round-robin order
    fn assign(&self, stream: TcpStream, peer: SocketAddr) {
        if self.open.load(Ordering::Acquire) >= self.max_connections {
            reject(stream, peer);
            return;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let handler = &self.handlers[n % self.handlers.len()];
        if let Err(e) = handler.add_conn(stream, peer) {
            warn!(
                "failed to add connection {} to I/O handler {}: {}",
                peer,
                handler.id(),
                e
            );
        }
    }
}

fn reject(mut stream: TcpStream, peer: SocketAddr) {
    warn!("rejecting {}: max number of clients reached", peer);
    let _ = stream.write_all(MAX_CLIENTS_REPLY);
}

/// Everything the single-threaded loop owns
struct EventLoop {
    listener: TcpListener,
    mux: Multiplexer,
    conns: HashMap<RawFd, Connection>,
    shard: Shard,
    lifecycle: Arc<Lifecycle>,
    max_connections: usize,
    expire_every: Duration,
}

impl EventLoop {
    fn run(mut self) -> Result<()> {
        self.listener.set_nonblocking(true)?;
        let listener_fd = self.listener.as_raw_fd();
        self.mux
            .monitor(listener_fd, Interest::Read)
            .context("cannot watch listening socket")?;
        info!("single-threaded event loop on {:?}", self.listener.local_addr());

        let lifecycle = self.lifecycle.clone();
        let mut backoff = ErrorBackoff::new();
        let mut last_sweep = Instant::now();
        loop {
            if last_sweep.elapsed() >= self.expire_every {
                let Some(_busy) = lifecycle.begin() else { break };
                self.shard.expire_cycle();
                last_sweep = Instant::now();
            }

            // wake up in time for the next sweep even without traffic
            let timeout = self.expire_every.saturating_sub(last_sweep.elapsed());
            let events = match self.mux.wait(Some(timeout)) {
                Ok(events) => {
                    backoff.reset();
                    events
                }
                Err(e) => {
                    warn!("event loop wait failed: {}", e);
                    backoff.sleep();
                    continue;
                }
            };
            if events.is_empty() {
                continue;
            }

            let Some(_busy) = lifecycle.begin() else { break };
            for ev in &events {
                if ev.fd == listener_fd {
                    self.accept_all();
                    continue;
                }
                let Some(conn) = self.conns.get_mut(&ev.fd) else {
                    continue;
                };
                let shard = &mut self.shard;
                let state = conn.on_event(ev, &self.mux, |cmd| shard.exec(&cmd));
                match state {
                    Ok(ConnState::Open) => {}
                    Ok(ConnState::Closed) => self.close(ev.fd),
                    Err(e) => {
                        warn!("I/O error on fd {}: {}", ev.fd, e);
                        self.close(ev.fd);
                    }
                }
            }
        }
        self.mux.close();
        info!("single-threaded event loop stopped");
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.conns.len() >= self.max_connections {
                        reject(stream, peer);
                        continue;
                    }
                    if let Err(e) = self.adopt(stream, peer) {
                        warn!("failed to watch connection {}: {}", peer, e);
                    }
                }
                Err(ref e) if would_block(e) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn adopt(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true).ok();
        let conn = Connection::new(mio::net::TcpStream::from_std(stream), peer);
        let fd = conn.fd();
        self.mux.monitor(fd, Interest::Read)?;
        self.conns.insert(fd, conn);
        debug!("accepted {} (fd {})", peer, fd);
        Ok(())
    }

    fn close(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.remove(&fd) {
            let _ = self.mux.unmonitor(fd);
            debug!("closed {}", conn.peer());
        }
    }
}
