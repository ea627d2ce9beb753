// src/http/request.rs
use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use super::CRLF;
use crate::auth::AuthService;
use crate::buffer::Buffer;

/// Longest request line or header line accepted before a CRLF shows up.
pub const MAX_LINE_LEN: usize = 8 * 1024;
/// Largest body accepted through `Content-Length`.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

const DEFAULT_HTML: [&str; 7] = [
    "/index", "/login", "/register", "/welcome", "/picture", "/video", "/error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The request reached `Finish` and will not change any more.
    Complete,
    /// More bytes are needed; parser state is kept for the next call.
    Incomplete,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line: {0:?}")]
    RequestLine(String),
    #[error("invalid Content-Length: {0:?}")]
    ContentLength(String),
    #[error("line or body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed form body")]
    Form,
}

/// An HTTP/1.x request assembled across reads, one phase at a time.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    phase: ParsePhase,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    form: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            phase: ParsePhase::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            form: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consumes as many complete lines (and the body) from `buf` as are
    /// available, advancing the phase.
    pub fn parse(
        &mut self,
        buf: &mut Buffer,
        auth: &dyn AuthService,
    ) -> Result<ParseStatus, ParseError> {
        while self.phase != ParsePhase::Finish {
            match self.phase {
                ParsePhase::RequestLine | ParsePhase::Headers => {
                    let Some(end) = buf.find(CRLF) else {
                        if buf.readable_bytes() > MAX_LINE_LEN {
                            return Err(ParseError::TooLarge(MAX_LINE_LEN));
                        }
                        return Ok(ParseStatus::Incomplete);
                    };
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    buf.retrieve(end + CRLF.len());

                    if self.phase == ParsePhase::RequestLine {
                        self.parse_request_line(&line)?;
                        self.normalize_path();
                    } else {
                        self.parse_header(&line);
                    }
                }
                ParsePhase::Body => {
                    let len = self.content_length()?;
                    if buf.readable_bytes() < len {
                        return Ok(ParseStatus::Incomplete);
                    }
                    self.body = String::from_utf8_lossy(&buf.peek()[..len]).into_owned();
                    buf.retrieve(len);
                    self.parse_body(auth)?;
                    self.phase = ParsePhase::Finish;
                }
                ParsePhase::Finish => unreachable!(),
            }
        }
        Ok(ParseStatus::Complete)
    }

    pub fn phase(&self) -> ParsePhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == ParsePhase::Finish
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn form(&self) -> &HashMap<String, String> {
        &self.form
    }

    /// Keep-alive needs both an explicit `Connection: keep-alive` and HTTP/1.1.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
            && self.version == "1.1"
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let (Some(method), Some(path), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::RequestLine(line.to_string()));
        };
        let Some(version) = proto.strip_prefix("HTTP/") else {
            return Err(ParseError::RequestLine(line.to_string()));
        };

        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        self.phase = ParsePhase::Headers;
        Ok(())
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// `Name: value` lines are headers; the first line without a colon
    /// (normally the empty line) ends the header block.
    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.headers.insert(name.to_string(), value.to_string());
            }
            None => self.phase = ParsePhase::Body,
        }
    }

    fn content_length(&self) -> Result<usize, ParseError> {
        let Some(raw) = self.header("Content-Length") else {
            return Ok(0);
        };
        let len: usize = raw
            .trim()
            .parse()
            .map_err(|_| ParseError::ContentLength(raw.to_string()))?;
        if len > MAX_BODY_LEN {
            return Err(ParseError::TooLarge(MAX_BODY_LEN));
        }
        Ok(len)
    }

    fn parse_body(&mut self, auth: &dyn AuthService) -> Result<(), ParseError> {
        let is_form = self
            .header("Content-Type")
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if self.method != "POST" || !is_form || self.body.is_empty() {
            return Ok(());
        }

        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(&self.body).map_err(|_| ParseError::Form)?;
        self.form = pairs.into_iter().collect();

        let Some(is_login) = self.form.get("isLogin") else {
            return Ok(());
        };
        let user = self.form.get("username").map(String::as_str).unwrap_or("");
        let password = self.form.get("password").map(String::as_str).unwrap_or("");

        let accepted = if is_login == "1" {
            auth.login(user, password)
        } else {
            auth.register(user, password)
        };
        debug!(user, is_login = is_login.as_str(), accepted, "form submitted");

        self.path = if accepted {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
        Ok(())
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuth;

    fn parse_all(raw: &[u8]) -> (HttpRequest, Result<ParseStatus, ParseError>) {
        let auth = MemoryAuth::new();
        let mut buf = Buffer::default();
        buf.append(raw);
        let mut req = HttpRequest::new();
        let res = req.parse(&mut buf, &auth);
        (req, res)
    }

    #[test]
    fn test_parse_keep_alive_request() {
        let (req, res) = parse_all(b"GET /index HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");

        assert_eq!(res, Ok(ParseStatus::Complete));
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert!(req.keep_alive());
    }

    #[test]
    fn test_root_maps_to_index() {
        let (req, _) = parse_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_keep_alive_requires_http11() {
        let (req, _) = parse_all(b"GET /a.txt HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.keep_alive());
        assert_eq!(req.path(), "/a.txt");
    }

    #[test]
    fn test_missing_http_token_fails() {
        let (_, res) = parse_all(b"GET /index 1.1\r\n\r\n");
        assert!(matches!(res, Err(ParseError::RequestLine(_))));

        let (_, res) = parse_all(b"GET  /index HTTP/1.1\r\n\r\n");
        assert!(matches!(res, Err(ParseError::RequestLine(_))));
    }

    #[test]
    fn test_incremental_across_reads() {
        let auth = MemoryAuth::new();
        let mut buf = Buffer::default();
        let mut req = HttpRequest::new();

        buf.append(b"GET /pic");
        assert_eq!(req.parse(&mut buf, &auth), Ok(ParseStatus::Incomplete));
        assert_eq!(req.phase(), ParsePhase::RequestLine);

        buf.append(b"ture HTTP/1.1\r\nConnec");
        assert_eq!(req.parse(&mut buf, &auth), Ok(ParseStatus::Incomplete));
        assert_eq!(req.phase(), ParsePhase::Headers);

        buf.append(b"tion: keep-alive\r\n\r\n");
        assert_eq!(req.parse(&mut buf, &auth), Ok(ParseStatus::Complete));
        assert_eq!(req.path(), "/picture.html");
        assert!(req.keep_alive());
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_body_waits_for_content_length() {
        let auth = MemoryAuth::new();
        let mut buf = Buffer::default();
        let mut req = HttpRequest::new();
        buf.append(b"PUT /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
        assert_eq!(req.parse(&mut buf, &auth), Ok(ParseStatus::Incomplete));
        assert_eq!(req.phase(), ParsePhase::Body);

        buf.append(b"cde");
        assert_eq!(req.parse(&mut buf, &auth), Ok(ParseStatus::Complete));
        assert_eq!(req.body(), "abcde");
    }

    #[test]
    fn test_bad_content_length() {
        let (_, res) = parse_all(b"POST /x HTTP/1.1\r\nContent-Length: lots\r\n\r\n");
        assert!(matches!(res, Err(ParseError::ContentLength(_))));
    }

    #[test]
    fn test_overlong_line_rejected() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_LINE_LEN + 1));
        let (_, res) = parse_all(&raw);
        assert_eq!(res, Err(ParseError::TooLarge(MAX_LINE_LEN)));
    }

    fn form_request(body: &str) -> Vec<u8> {
        format!(
            "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn test_form_register_and_login_redirects() {
        let auth = MemoryAuth::new();
        let mut buf = Buffer::default();

        let mut req = HttpRequest::new();
        buf.append(form_request("username=ada+l&password=p%40ss&isLogin=0"));
        assert_eq!(req.parse(&mut buf, &auth), Ok(ParseStatus::Complete));
        assert_eq!(req.form().get("username").map(String::as_str), Some("ada l"));
        assert_eq!(req.path(), "/welcome.html");

        req.reset();
        buf.append(form_request("username=ada+l&password=p%40ss&isLogin=1"));
        req.parse(&mut buf, &auth).unwrap();
        assert_eq!(req.path(), "/welcome.html");

        req.reset();
        buf.append(form_request("username=ada+l&password=wrong&isLogin=1"));
        req.parse(&mut buf, &auth).unwrap();
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn test_form_without_is_login_skips_auth() {
        let (req, res) = parse_all(&form_request("username=x&password=y"));
        assert_eq!(res, Ok(ParseStatus::Complete));
        assert_eq!(req.path(), "/login.html");
    }
}
