// src/conn.rs
use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::auth::AuthService;
use crate::buffer::Buffer;
use crate::http::{HttpRequest, HttpResponse, ParseStatus};
use crate::metrics::ServerMetrics;
use crate::syscalls;

/// Stack spill-over for a single `readv`.
pub const OVERFLOW_BUF_SIZE: usize = 65535;
/// Below this many unsent bytes a level-triggered writer yields to the reactor.
pub const CONTINUE_SEND_BYTES: usize = 10240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Accepted = 0,
    Reading = 1,
    Processing = 2,
    Writing = 3,
    KeepAlive = 4,
    Closed = 5,
}

/// What every connection needs from the server to answer a request.
pub struct ConnContext {
    pub static_root: PathBuf,
    pub auth: Arc<dyn AuthService>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// A response is staged and waiting to be written.
    Respond,
    /// The request is not complete yet; wait for more bytes.
    Incomplete,
}

pub struct HttpConn {
    fd: RawFd,
    peer: SocketAddrV4,
    state: ConnState,
    edge_triggered: bool,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: Option<HttpResponse>,
    body_sent: usize,
    keep_alive: bool,
    metrics: Arc<ServerMetrics>,
}

impl HttpConn {
    pub fn new(
        fd: RawFd,
        peer: SocketAddrV4,
        edge_triggered: bool,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        metrics.inc_conn();
        debug!(fd, %peer, active = metrics.active(), "connection accepted");
        Self {
            fd,
            peer,
            state: ConnState::Accepted,
            edge_triggered,
            read_buf: Buffer::default(),
            write_buf: Buffer::default(),
            request: HttpRequest::new(),
            response: None,
            body_sent: 0,
            keep_alive: false,
            metrics,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Header bytes plus the unsent part of the mapped body.
    pub fn bytes_to_send(&self) -> usize {
        self.write_buf.readable_bytes() + self.body_remaining().len()
    }

    fn body_remaining(&self) -> &[u8] {
        match &self.response {
            Some(resp) => &resp.body()[self.body_sent..],
            None => &[],
        }
    }

    /// Reads everything currently available (edge-triggered) or one chunk
    /// (level-triggered). A clean EOF before any byte arrives is reported as
    /// `UnexpectedEof`; `WouldBlock` only when nothing was read.
    pub fn read(&mut self) -> io::Result<usize> {
        self.state = ConnState::Reading;
        let mut total = 0;
        loop {
            match self.read_once() {
                Ok(0) if total == 0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    fn read_once(&mut self) -> io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_BUF_SIZE];
        let writable = self.read_buf.writable_bytes();
        let n = {
            let mut iov = [
                IoSliceMut::new(self.read_buf.begin_write()),
                IoSliceMut::new(&mut overflow),
            ];
            syscalls::readv(self.fd, &mut iov)?
        };

        if n <= writable {
            self.read_buf.has_written(n);
        } else {
            self.read_buf.has_written(writable);
            self.read_buf.append(&overflow[..n - writable]);
        }
        Ok(n)
    }

    /// Feeds the read buffer to the parser and, once a request is complete or
    /// malformed, stages the response in the write buffer.
    pub fn process(&mut self, ctx: &ConnContext) -> Processed {
        self.state = ConnState::Processing;
        let response = match self.request.parse(&mut self.read_buf, ctx.auth.as_ref()) {
            Ok(ParseStatus::Incomplete) => return Processed::Incomplete,
            Ok(ParseStatus::Complete) => {
                self.metrics.inc_req();
                debug!(
                    fd = self.fd,
                    method = self.request.method(),
                    path = self.request.path(),
                    "request"
                );
                HttpResponse::new(
                    &ctx.static_root,
                    self.request.path(),
                    self.request.keep_alive(),
                    200,
                )
            }
            Err(e) => {
                debug!(fd = self.fd, error = %e, "bad request");
                HttpResponse::new(&ctx.static_root, self.request.path(), false, 400)
            }
        };

        self.request.reset();
        self.keep_alive = response.keep_alive();
        self.body_sent = 0;
        let response = self.response.insert(response);
        response.make_response(&mut self.write_buf);
        self.state = ConnState::Writing;
        Processed::Respond
    }

    /// Gathers header bytes and mapped body into `writev` calls. Returns the
    /// number of bytes still unsent; zero means the response is complete.
    pub fn write(&mut self) -> io::Result<usize> {
        self.state = ConnState::Writing;
        loop {
            if self.bytes_to_send() == 0 {
                break;
            }

            let res = {
                let iov = [
                    IoSlice::new(self.write_buf.peek()),
                    IoSlice::new(self.body_remaining()),
                ];
                syscalls::writev(self.fd, &iov)
            };
            let n = match res {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.metrics.add_bytes(n);

            let head = self.write_buf.readable_bytes();
            if n > head {
                self.write_buf.retrieve_all();
                self.body_sent += n - head;
            } else {
                self.write_buf.retrieve(n);
            }

            let remaining = self.bytes_to_send();
            if remaining > 0 && !self.edge_triggered && remaining <= CONTINUE_SEND_BYTES {
                return Ok(remaining);
            }
        }

        self.response = None;
        self.body_sent = 0;
        if self.keep_alive {
            self.state = ConnState::KeepAlive;
        }
        Ok(0)
    }

    /// Releases the descriptor and every resource tied to it. Returns `false`
    /// when the connection was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.state = ConnState::Closed;
        self.response = None;
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        syscalls::close_fd(self.fd);
        self.metrics.dec_conn();
        debug!(fd = self.fd, peer = %self.peer, active = self.metrics.active(), "connection closed");
        true
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuth;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;

    fn setup(edge_triggered: bool) -> (HttpConn, UnixStream, Arc<ServerMetrics>) {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let metrics = Arc::new(ServerMetrics::new());
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000);
        let conn = HttpConn::new(server.into_raw_fd(), peer, edge_triggered, metrics.clone());
        (conn, client, metrics)
    }

    fn context(root: &TempDir) -> ConnContext {
        ConnContext {
            static_root: root.path().to_path_buf(),
            auth: Arc::new(MemoryAuth::new()),
        }
    }

    #[test]
    fn test_full_cycle_keep_alive() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("index.html"), "hello etude").unwrap();
        let ctx = context(&root);
        let (mut conn, mut client, metrics) = setup(true);
        assert_eq!(metrics.active(), 1);

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(conn.read().unwrap() > 0);
        assert_eq!(conn.process(&ctx), Processed::Respond);
        assert!(conn.is_keep_alive());
        assert_eq!(conn.write().unwrap(), 0);
        assert_eq!(conn.state(), ConnState::KeepAlive);
        assert_eq!(metrics.requests(), 1);

        let mut out = vec![0u8; 4096];
        let n = client.read(&mut out).unwrap();
        let text = String::from_utf8_lossy(&out[..n]);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhello etude"));
        assert_eq!(metrics.bytes(), n as u64);
    }

    #[test]
    fn test_partial_request_is_incomplete() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root);
        let (mut conn, mut client, _) = setup(false);

        client.write_all(b"GET /index HT").unwrap();
        conn.read().unwrap();
        assert_eq!(conn.process(&ctx), Processed::Incomplete);
        assert_eq!(conn.bytes_to_send(), 0);
    }

    #[test]
    fn test_malformed_request_answers_400_and_closes() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("400.html"), "bad").unwrap();
        let ctx = context(&root);
        let (mut conn, mut client, _) = setup(true);

        client.write_all(b"NONSENSE\r\n\r\n").unwrap();
        conn.read().unwrap();
        assert_eq!(conn.process(&ctx), Processed::Respond);
        assert!(!conn.is_keep_alive());
        assert_eq!(conn.write().unwrap(), 0);

        let mut out = vec![0u8; 1024];
        let n = client.read(&mut out).unwrap();
        assert!(out[..n].starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_read_larger_than_buffer_spills_over() {
        let (mut conn, mut client, _) = setup(true);
        let payload = vec![b'x'; 5000];
        client.write_all(&payload).unwrap();

        assert_eq!(conn.read().unwrap(), 5000);
        assert_eq!(conn.read_buf.readable_bytes(), 5000);
        assert_eq!(
            conn.read().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_peer_close_is_eof() {
        let (mut conn, client, _) = setup(false);
        drop(client);
        assert_eq!(conn.read().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut conn, _client, metrics) = setup(false);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert_eq!(metrics.active(), 0);
        drop(conn);
        assert_eq!(metrics.active(), 0);
    }
}
