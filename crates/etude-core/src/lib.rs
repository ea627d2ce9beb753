// src/lib.rs
pub mod auth;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use auth::{AuthService, MemoryAuth};
pub use config::{Config, LogConfig, LogSink, TriggerMode};
pub use error::{EtudeError, EtudeResult};
pub use logging::{LogGuard, init_logging};
pub use server::{Server, ShutdownHandle};
