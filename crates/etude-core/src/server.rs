// src/server.rs
//! The reactor thread and its wiring to the worker pool.
//!
//! Connection descriptors are always registered one-shot. A worker re-arms
//! the descriptor while it still holds that connection's lock, so at most one
//! task touches a connection at a time and the per-connection mutex is only
//! ever contended by a close racing an in-flight task.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::AuthService;
use crate::config::{Config, TriggerMode};
use crate::conn::{ConnContext, HttpConn, Processed};
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::syscalls::{self, Event, Events, Interest, Reactor};
use crate::timer::TimerHeap;

pub const BUSY_MESSAGE: &str = "The connection was interrupted due to server overload";

const MAX_EVENTS: usize = 1024;

type ConnRef = Arc<Mutex<HttpConn>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the listening descriptor.
struct Listener {
    fd: RawFd,
    edge: bool,
}

impl Drop for Listener {
    fn drop(&mut self) {
        syscalls::close_fd(self.fd);
    }
}

/// Self-pipe registered in the reactor so another thread can interrupt `wait`.
struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
    stop: AtomicBool,
}

impl Drop for Waker {
    fn drop(&mut self) {
        syscalls::close_fd(self.read_fd);
        syscalls::close_fd(self.write_fd);
    }
}

/// Stops a running [`Server`] from any thread, including a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.waker.stop.store(true, Ordering::Release);
        syscalls::notify_pipe(self.waker.write_fd);
    }
}

/// State reachable from the reactor thread, worker tasks and timer callbacks.
struct Shared {
    reactor: Reactor,
    timer: Mutex<TimerHeap>,
    conns: Mutex<HashMap<RawFd, ConnRef>>,
    pool: WorkerPool,
    metrics: Arc<ServerMetrics>,
    ctx: ConnContext,
    conn_events: Interest,
    conn_edge: bool,
    timeout: Option<Duration>,
    max_connections: usize,
}

pub struct Server {
    shared: Arc<Shared>,
    listener: Listener,
    waker: Arc<Waker>,
    local_port: u16,
}

impl Server {
    /// Binds the listening socket, creates the reactor and starts the workers.
    pub fn new(config: &Config, auth: Arc<dyn AuthService>) -> EtudeResult<Self> {
        config.validate()?;
        let trigger = config.trigger();

        let listener = Listener {
            fd: syscalls::create_listen_socket(&config.host, config.port, config.linger)?,
            edge: trigger.listen_edge,
        };
        let local_port = syscalls::local_port(listener.fd)?;

        let (read_fd, write_fd) = syscalls::create_pipe()?;
        let waker = Arc::new(Waker {
            read_fd,
            write_fd,
            stop: AtomicBool::new(false),
        });

        let reactor = Reactor::new()?;
        let mut listen_events = Interest::READABLE | Interest::PEER_HANGUP;
        if listener.edge {
            listen_events |= Interest::EDGE;
        }
        reactor.add(listener.fd, listen_events)?;
        reactor.add(waker.read_fd, Interest::READABLE)?;

        let mut conn_events = Interest::PEER_HANGUP | Interest::ONESHOT;
        if trigger.conn_edge {
            conn_events |= Interest::EDGE;
        }

        if !config.static_dir.is_dir() {
            warn!(dir = %config.static_dir.display(), "static root is not a directory");
        }

        let shared = Arc::new(Shared {
            reactor,
            timer: Mutex::new(TimerHeap::new()),
            conns: Mutex::new(HashMap::new()),
            pool: WorkerPool::new(config.workers)?,
            metrics: Arc::new(ServerMetrics::new()),
            ctx: ConnContext {
                static_root: config.static_dir.clone(),
                auth,
            },
            conn_events,
            conn_edge: trigger.conn_edge,
            timeout: (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms)),
            max_connections: config.max_connections,
        });

        log_banner(config, trigger, local_port);

        Ok(Self {
            shared,
            listener,
            waker,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: self.waker.clone(),
        }
    }

    /// Runs the event loop until [`ShutdownHandle::shutdown`] is called, then
    /// closes every connection and drains the worker pool.
    pub fn run(&self) -> EtudeResult<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while !self.waker.stop.load(Ordering::Acquire) {
            let timeout_ms = self.wait_timeout();
            if let Err(e) = self.shared.reactor.wait(&mut events, timeout_ms) {
                self.stop();
                return Err(e.into());
            }
            for event in events.iter() {
                self.dispatch(event);
            }
        }

        self.stop();
        Ok(())
    }

    fn wait_timeout(&self) -> i32 {
        if self.shared.timeout.is_none() {
            return -1;
        }
        match lock(&self.shared.timer).next_expiry() {
            Some(left) => left.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
            None => -1,
        }
    }

    fn dispatch(&self, event: Event) {
        let fd = event.fd;
        if fd == self.listener.fd {
            self.accept_all();
        } else if fd == self.waker.read_fd {
            syscalls::drain_pipe(fd);
        } else if event.is_hangup() {
            self.shared.submit(fd, Shared::close_task);
        } else if event.is_readable() {
            self.shared.extend_time(fd);
            self.shared.submit(fd, Shared::on_read);
        } else if event.is_writable() {
            self.shared.extend_time(fd);
            self.shared.submit(fd, Shared::on_write);
        } else {
            warn!(fd, events = event.events, "unexpected event");
        }
    }

    fn accept_all(&self) {
        loop {
            let (fd, peer) = match syscalls::accept_connection(self.listener.fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };

            match self.shared.check_capacity() {
                Ok(()) => self.shared.add_client(fd, peer),
                Err(e) => {
                    let _ = syscalls::send_message(fd, BUSY_MESSAGE.as_bytes());
                    syscalls::close_fd(fd);
                    warn!(%peer, error = %e, "server busy");
                }
            }

            if !self.listener.edge {
                break;
            }
        }
    }

    fn stop(&self) {
        info!("shutting down");
        self.shared.pool.shutdown();

        let live: Vec<ConnRef> = lock(&self.shared.conns).drain().map(|(_, c)| c).collect();
        for conn in &live {
            let mut guard = lock(conn);
            self.shared.close_locked(conn, &mut guard);
        }
        lock(&self.shared.timer).clear();

        info!(
            closed = live.len(),
            requests = self.shared.metrics.requests(),
            bytes = self.shared.metrics.bytes(),
            "server stopped"
        );
    }
}

impl Shared {
    fn lookup(&self, fd: RawFd) -> Option<ConnRef> {
        lock(&self.conns).get(&fd).cloned()
    }

    fn check_capacity(&self) -> EtudeResult<()> {
        let live = self.metrics.active();
        if live >= self.max_connections {
            return Err(EtudeError::Capacity(live));
        }
        Ok(())
    }

    fn add_client(self: &Arc<Self>, fd: RawFd, peer: SocketAddrV4) {
        let conn = Arc::new(Mutex::new(HttpConn::new(
            fd,
            peer,
            self.conn_edge,
            self.metrics.clone(),
        )));
        lock(&self.conns).insert(fd, conn.clone());

        if let Some(timeout) = self.timeout {
            let shared = Arc::downgrade(self);
            let target = conn.clone();
            lock(&self.timer).add(
                fd,
                timeout,
                Box::new(move || {
                    if let Some(shared) = shared.upgrade() {
                        debug!(fd, "idle timeout");
                        shared.submit_conn(target.clone(), Shared::close_task);
                    }
                }),
            );
        }

        if let Err(e) = self.reactor.add(fd, self.conn_events | Interest::READABLE) {
            warn!(fd, error = %e, "register connection failed");
            let mut guard = lock(&conn);
            self.close_locked(&conn, &mut guard);
        }
    }

    fn extend_time(&self, fd: RawFd) {
        if let Some(timeout) = self.timeout {
            lock(&self.timer).adjust(fd, timeout);
        }
    }

    fn submit(self: &Arc<Self>, fd: RawFd, task: fn(&Arc<Shared>, &ConnRef)) {
        match self.lookup(fd) {
            Some(conn) => self.submit_conn(conn, task),
            None => debug!(fd, "event for unknown descriptor"),
        }
    }

    fn submit_conn(self: &Arc<Self>, conn: ConnRef, task: fn(&Arc<Shared>, &ConnRef)) {
        let shared = self.clone();
        if !self.pool.submit(move || task(&shared, &conn)) {
            debug!("worker pool closed, task dropped");
        }
    }

    fn close_task(self: &Arc<Self>, conn: &ConnRef) {
        let mut guard = lock(conn);
        self.close_locked(conn, &mut guard);
    }

    fn on_read(self: &Arc<Self>, conn: &ConnRef) {
        let mut guard = lock(conn);
        if guard.is_closed() {
            return;
        }
        match guard.read() {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(fd = guard.fd(), error = %e, "read failed");
                return self.close_locked(conn, &mut guard);
            }
        }
        self.on_process(conn, &mut guard);
    }

    fn on_process(&self, conn: &ConnRef, c: &mut HttpConn) {
        match c.process(&self.ctx) {
            Processed::Respond => self.rearm(conn, c, Interest::WRITABLE),
            Processed::Incomplete => self.rearm(conn, c, Interest::READABLE),
        }
    }

    fn on_write(self: &Arc<Self>, conn: &ConnRef) {
        let mut guard = lock(conn);
        if guard.is_closed() {
            return;
        }
        match guard.write() {
            Ok(0) if guard.is_keep_alive() => self.on_process(conn, &mut guard),
            Ok(0) => self.close_locked(conn, &mut guard),
            Ok(_) => self.rearm(conn, &mut guard, Interest::WRITABLE),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.rearm(conn, &mut guard, Interest::WRITABLE)
            }
            Err(e) => {
                debug!(fd = guard.fd(), error = %e, "write failed");
                self.close_locked(conn, &mut guard);
            }
        }
    }

    fn rearm(&self, conn: &ConnRef, c: &mut HttpConn, interest: Interest) {
        if let Err(e) = self.reactor.modify(c.fd(), self.conn_events | interest) {
            warn!(fd = c.fd(), error = %e, "re-arm failed");
            self.close_locked(conn, c);
        }
    }

    /// Must be called with `conn` locked. Everything keyed by the descriptor
    /// is dropped before the descriptor itself is closed, so a reused fd can
    /// never collide with stale state.
    fn close_locked(&self, conn: &ConnRef, c: &mut HttpConn) {
        if c.is_closed() {
            return;
        }
        let fd = c.fd();
        {
            let mut conns = lock(&self.conns);
            if conns.get(&fd).is_some_and(|current| Arc::ptr_eq(current, conn)) {
                conns.remove(&fd);
            }
        }
        lock(&self.timer).remove(fd);
        if let Err(e) = self.reactor.remove(fd) {
            debug!(fd, error = %e, "epoll remove failed");
        }
        c.close();
    }
}

fn log_banner(config: &Config, trigger: TriggerMode, port: u16) {
    let mode = |edge: bool| if edge { "ET" } else { "LT" };
    info!("========== etude server init ==========");
    info!(
        host = %config.host,
        port,
        linger = config.linger,
        "listening"
    );
    info!(
        listen = mode(trigger.listen_edge),
        conn = mode(trigger.conn_edge),
        timeout_ms = config.timeout_ms,
        "trigger modes"
    );
    info!(
        workers = config.workers,
        max_connections = config.max_connections,
        static_dir = %config.static_dir.display(),
        log_sink = ?config.log.sink,
        "resources"
    );
}
