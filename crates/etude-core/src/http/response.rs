// src/http/response.rs
//! Response assembly: status line and headers go into the connection's write
//! buffer, the file body stays in a read-only memory map.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::buffer::Buffer;

pub const KEEP_ALIVE_TIMEOUT_SECS: u64 = 60;
pub const KEEP_ALIVE_MAX: u32 = 16;

const WORLD_READABLE: u32 = 0o004;

const NOT_FOUND_BODY: &str = "<html><title>Error</title><body bgcolor=\"ffffff\">\
<p>File not found</p><hr><em>etude</em></body></html>";

fn reason(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

/// One response plan. Dropping it (or calling [`unmap`](Self::unmap))
/// releases the mapped file.
#[derive(Debug)]
pub struct HttpResponse {
    code: u16,
    keep_alive: bool,
    path: String,
    static_root: PathBuf,
    file: Option<Mmap>,
}

impl HttpResponse {
    pub fn new(static_root: impl Into<PathBuf>, path: &str, keep_alive: bool, code: u16) -> Self {
        Self {
            code,
            keep_alive,
            path: path.to_string(),
            static_root: static_root.into(),
            file: None,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The mapped file body, empty when nothing is mapped.
    pub fn body(&self) -> &[u8] {
        self.file.as_deref().unwrap_or(&[])
    }

    pub fn body_len(&self) -> usize {
        self.body().len()
    }

    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Resolves the final status, writes the status line and headers into
    /// `buf` and maps the body (or appends an inline error body to `buf`).
    pub fn make_response(&mut self, buf: &mut Buffer) {
        if self.code == 200 {
            self.code = self.file_status();
        }
        self.error_page();
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    fn full_path(&self) -> PathBuf {
        self.static_root.join(self.path.trim_start_matches('/'))
    }

    fn file_status(&self) -> u16 {
        let has_parent = Path::new(&self.path)
            .components()
            .any(|c| c == Component::ParentDir);
        if has_parent {
            warn!(path = %self.path, "path traversal rejected");
            return 403;
        }
        match fs::metadata(self.full_path()) {
            Ok(meta) if meta.is_dir() => 404,
            Ok(meta) if meta.permissions().mode() & WORLD_READABLE == 0 => 403,
            Ok(_) => 200,
            Err(_) => 404,
        }
    }

    fn error_page(&mut self) {
        if matches!(self.code, 400 | 403 | 404) {
            self.path = format!("/{}.html", self.code);
        }
    }

    fn add_status_line(&mut self, buf: &mut Buffer) {
        let text = match reason(self.code) {
            Some(text) => text,
            None => {
                self.code = 400;
                "Bad Request"
            }
        };
        buf.append(format!("HTTP/1.1 {} {}\r\n", self.code, text));
    }

    fn add_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append("Connection: keep-alive\r\n");
            buf.append(format!(
                "Keep-Alive: timeout={}, max={}\r\n",
                KEEP_ALIVE_TIMEOUT_SECS, KEEP_ALIVE_MAX
            ));
        } else {
            buf.append("Connection: close\r\n");
        }
        buf.append(format!("Content-Type: {}\r\n", self.content_type()));
    }

    fn content_type(&self) -> String {
        match Path::new(&self.path).extension() {
            Some(_) => mime_guess::from_path(&self.path)
                .first_raw()
                .unwrap_or("text/plain")
                .to_string(),
            None => "text/plain".to_string(),
        }
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let full = self.full_path();
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %full.display(), error = %e, "cannot open body");
                return self.inline_error(buf);
            }
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => return self.inline_error(buf),
        };
        if len == 0 {
            buf.append("Content-Length: 0\r\n\r\n");
            return;
        }

        // SAFETY: the map is read-only and files under the static root are not
        // truncated while being served.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                buf.append(format!("Content-Length: {}\r\n\r\n", map.len()));
                self.file = Some(map);
            }
            Err(e) => {
                warn!(path = %full.display(), error = %e, "mmap failed");
                self.inline_error(buf);
            }
        }
    }

    fn inline_error(&mut self, buf: &mut Buffer) {
        self.file = None;
        buf.append(format!("Content-Length: {}\r\n\r\n", NOT_FOUND_BODY.len()));
        buf.append(NOT_FOUND_BODY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>hello</h1>").unwrap();
        fs::write(dir.path().join("404.html"), "<p>no such page</p>").unwrap();
        fs::write(dir.path().join("400.html"), "<p>bad</p>").unwrap();
        fs::write(dir.path().join("403.html"), "<p>forbidden</p>").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        dir
    }

    fn render(root: &Path, path: &str, keep_alive: bool, code: u16) -> (HttpResponse, String) {
        let mut resp = HttpResponse::new(root, path, keep_alive, code);
        let mut buf = Buffer::default();
        resp.make_response(&mut buf);
        let head = String::from_utf8(buf.retrieve_all_to_vec()).unwrap();
        (resp, head)
    }

    #[test]
    fn test_existing_file_is_mapped() {
        let dir = site();
        let (resp, head) = render(dir.path(), "/index.html", true, 200);

        assert_eq!(resp.code(), 200);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Keep-Alive: timeout=60, max=16\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.ends_with("Content-Length: 14\r\n\r\n"));
        assert_eq!(resp.body(), b"<h1>hello</h1>");
    }

    #[test]
    fn test_missing_file_uses_404_page() {
        let dir = site();
        let (resp, head) = render(dir.path(), "/nope.html", false, 200);

        assert_eq!(resp.code(), 404);
        assert_eq!(resp.path(), "/404.html");
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.ends_with("Content-Length: 19\r\n\r\n"));
        assert_eq!(resp.body_len(), 19);
    }

    #[test]
    fn test_directory_is_not_found() {
        let dir = site();
        let (resp, _) = render(dir.path(), "/sub", false, 200);
        assert_eq!(resp.code(), 404);
    }

    #[test]
    fn test_unreadable_file_is_forbidden() {
        let dir = site();
        let secret = dir.path().join("secret.html");
        fs::write(&secret, "top secret").unwrap();
        fs::set_permissions(&secret, Permissions::from_mode(0o600)).unwrap();

        let (resp, head) = render(dir.path(), "/secret.html", false, 200);
        assert_eq!(resp.code(), 403);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(resp.body(), b"<p>forbidden</p>");
    }

    #[test]
    fn test_parent_components_are_forbidden() {
        let dir = site();
        let (resp, _) = render(dir.path(), "/../etc/passwd", false, 200);
        assert_eq!(resp.code(), 403);
        assert_eq!(resp.path(), "/403.html");
    }

    #[test]
    fn test_bad_request_keeps_400() {
        let dir = site();
        let (resp, head) = render(dir.path(), "", false, 400);
        assert_eq!(resp.code(), 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(resp.body(), b"<p>bad</p>");
    }

    #[test]
    fn test_unknown_code_is_coerced() {
        let dir = site();
        let (resp, head) = render(dir.path(), "/index.html", false, 302);
        assert_eq!(resp.code(), 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_missing_error_page_falls_back_inline() {
        let dir = TempDir::new().unwrap();
        let (resp, head) = render(dir.path(), "/gone.png", false, 200);

        assert_eq!(resp.code(), 404);
        assert_eq!(resp.body_len(), 0);
        let expected = format!("Content-Length: {}\r\n\r\n{}", NOT_FOUND_BODY.len(), NOT_FOUND_BODY);
        assert!(head.ends_with(&expected));
    }

    #[test]
    fn test_empty_file_has_no_map() {
        let dir = site();
        let (mut resp, head) = render(dir.path(), "/empty.txt", false, 200);
        assert_eq!(resp.code(), 200);
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.ends_with("Content-Length: 0\r\n\r\n"));
        resp.unmap();
        assert!(resp.body().is_empty());
    }
}
