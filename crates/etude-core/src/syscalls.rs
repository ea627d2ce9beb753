// src/syscalls.rs
use crate::error::{EtudeError, EtudeResult};
use libc::{c_int, c_void, socklen_t};
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking IPv4 TCP listener.
///
/// - SO_REUSEADDR is always set.
/// - SO_LINGER is set explicitly: on = linger 3s, off = disabled.
pub fn create_listen_socket(host: &str, port: u16, linger: bool) -> EtudeResult<RawFd> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| EtudeError::Config(format!("invalid IPv4 listen address: {}", host)))?;

    unsafe {
        // 1. Atomic non-blocking socket
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 2. Let unsent data linger after close
        let linger_opt = libc::linger {
            l_onoff: linger as c_int,
            l_linger: if linger { 3 } else { 0 },
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger_opt as *const _ as *const c_void,
            mem::size_of_val(&linger_opt) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 3. Port reuse across restarts
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 4. Bind
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(ip.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 5. Listen
        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept one pending connection as a non-blocking socket.
/// Returns `Ok(None)` when the backlog is empty.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddrV4)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }

        let peer = SocketAddrV4::new(
            Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
            u16::from_be(addr.sin_port),
        );
        Ok(Some((fd, peer)))
    }
}

pub fn local_port(fd: RawFd) -> io::Result<u16> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }
}

/// Best-effort write of a short message, used for rejecting connections.
pub fn send_message(fd: RawFd, msg: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::send(fd, msg.as_ptr() as *const c_void, msg.len(), libc::MSG_NOSIGNAL);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Scatter read. `WouldBlock` is surfaced as an error so callers can tell it from EOF.
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    // IoSliceMut is ABI-compatible with iovec on unix.
    let res = unsafe {
        libc::readv(
            fd,
            bufs.as_mut_ptr() as *const libc::iovec,
            bufs.len() as c_int,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Gather write of all `bufs` in a single syscall.
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let res = unsafe {
        libc::writev(
            fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as c_int,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

// ---- Wake-up Pipe ----

/// Create a non-blocking Unix pipe. Returns (read_fd, write_fd).
pub fn create_pipe() -> EtudeResult<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Write a single wake-up byte. A full pipe already guarantees a pending wake-up.
pub fn notify_pipe(write_fd: RawFd) {
    let byte = [1u8];
    unsafe {
        libc::write(write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

/// Drain every pending wake-up byte.
pub fn drain_pipe(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

// ---- Epoll Reactor ----

/// Readiness interest bits for [`Reactor`] registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer closed its write half.
    pub const PEER_HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    /// Disarm after one delivery; re-arm with [`Reactor::modify`].
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_edge(self) -> bool {
        self.contains(Interest::EDGE)
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// One readiness delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub events: u32,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.events & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.events & libc::EPOLLOUT as u32 != 0
    }

    /// Peer hang-up, full hang-up or socket error.
    pub fn is_hangup(&self) -> bool {
        self.events & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }
}

/// Reusable output array for [`Reactor::wait`].
pub struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf[..self.len].iter().map(|ev| Event {
            fd: ev.u64 as RawFd,
            events: ev.events,
        })
    }
}

/// Thin epoll wrapper. `epoll_ctl` is thread-safe, so registrations may be
/// changed from any thread while the owning thread blocks in [`Reactor::wait`].
pub struct Reactor {
    fd: RawFd,
}

impl Reactor {
    pub fn new() -> EtudeResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Blocks until readiness or `timeout_ms` (-1 = forever). EINTR yields zero events.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.buf.as_mut_ptr(),
                events.buf.len() as c_int,
                timeout_ms,
            )
        };

        if res < 0 {
            events.len = 0;
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        events.len = res as usize;
        Ok(events.len)
    }

    fn ctl(&self, op: c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_bits_compose() {
        let i = Interest::READABLE | Interest::ONESHOT | Interest::EDGE;
        assert!(i.contains(Interest::READABLE));
        assert!(i.is_edge());
        assert!(!i.contains(Interest::WRITABLE));
    }

    #[test]
    fn test_oneshot_fires_once_until_rearmed() {
        let reactor = Reactor::new().unwrap();
        let (rd, wr) = create_pipe().unwrap();
        reactor.add(rd, Interest::READABLE | Interest::ONESHOT).unwrap();
        notify_pipe(wr);

        let mut events = Events::with_capacity(8);
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);
        let ev = events.iter().next().unwrap();
        assert_eq!(ev.fd, rd);
        assert!(ev.is_readable());

        // Still readable, but disarmed.
        assert_eq!(reactor.wait(&mut events, 50).unwrap(), 0);

        reactor.modify(rd, Interest::READABLE | Interest::ONESHOT).unwrap();
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);

        drain_pipe(rd);
        reactor.remove(rd).unwrap();
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_level_triggered_repeats() {
        let reactor = Reactor::new().unwrap();
        let (rd, wr) = create_pipe().unwrap();
        reactor.add(rd, Interest::READABLE).unwrap();
        notify_pipe(wr);

        let mut events = Events::with_capacity(8);
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);
        assert_eq!(reactor.wait(&mut events, 1000).unwrap(), 1);

        drain_pipe(rd);
        assert_eq!(reactor.wait(&mut events, 20).unwrap(), 0);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_listen_and_accept() {
        let fd = create_listen_socket("127.0.0.1", 0, false).unwrap();
        let port = local_port(fd).unwrap();
        assert_eq!(accept_connection(fd).unwrap(), None);

        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(conn) = accept_connection(fd).unwrap() {
                accepted = Some(conn);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (conn_fd, peer) = accepted.expect("connection not accepted");
        assert_eq!(*peer.ip(), Ipv4Addr::LOCALHOST);
        close_fd(conn_fd);
        close_fd(fd);
    }
}
