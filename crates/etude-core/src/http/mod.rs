// src/http/mod.rs
pub mod request;
pub mod response;

pub use request::{HttpRequest, ParseError, ParsePhase, ParseStatus};
pub use response::{HttpResponse, KEEP_ALIVE_MAX, KEEP_ALIVE_TIMEOUT_SECS};

pub const CRLF: &[u8] = b"\r\n";
