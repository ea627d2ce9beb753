// src/config.rs
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{EtudeError, EtudeResult};

/// Where log records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    Terminal,
    File,
    Both,
}

impl FromStr for LogSink {
    type Err = EtudeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "terminal" | "stdout" => Ok(LogSink::Terminal),
            "file" => Ok(LogSink::File),
            "both" => Ok(LogSink::Both),
            other => Err(EtudeError::Config(format!("unknown log sink {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset (e.g. `info`).
    pub level: String,
    pub sink: LogSink,
    /// Directory for the file sink.
    pub dir: PathBuf,
    /// Bounded queue between logging threads and the file writer.
    pub queue_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            sink: LogSink::Terminal,
            dir: PathBuf::from("./log"),
            queue_capacity: 1024,
        }
    }
}

/// Edge/level triggering for the listening socket and for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listen_edge: bool,
    pub conn_edge: bool,
}

impl TriggerMode {
    /// 0 = LT/LT, 1 = ET listen, 2 = ET connections, anything else = ET/ET.
    pub fn from_choice(choice: u8) -> Self {
        let (listen_edge, conn_edge) = match choice {
            0 => (false, false),
            1 => (true, false),
            2 => (false, true),
            _ => (true, true),
        };
        Self {
            listen_edge,
            conn_edge,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// IPv4 address to bind (default: 0.0.0.0)
    pub host: String,

    /// Listen port, 1024-65535 (default: 7777)
    pub port: u16,

    /// Trigger-mode choice, see [`TriggerMode::from_choice`] (default: 3)
    pub trigger_mode: u8,

    /// Idle timeout in milliseconds, 0 disables eviction (default: 60000)
    pub timeout_ms: u64,

    /// Graceful close with SO_LINGER of 3 seconds (default: true)
    pub linger: bool,

    /// Worker threads (default: number of CPUs)
    pub workers: usize,

    /// Live connection cap (default: 65535)
    pub max_connections: usize,

    /// Root of all response bodies (default: ./static)
    pub static_dir: PathBuf,

    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        let static_dir = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("static");
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
            trigger_mode: 3,
            timeout_ms: 60_000,
            linger: true,
            workers: num_cpus::get(),
            max_connections: 65535,
            static_dir,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same mapping as [`Config::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> EtudeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(host) = lookup("ETUDE_HOST") {
            cfg.host = host;
        }
        if let Some(port) = lookup("ETUDE_PORT") {
            cfg.port = parse_value("ETUDE_PORT", &port)?;
        }
        if let Some(mode) = lookup("ETUDE_TRIGGER_MODE") {
            cfg.trigger_mode = parse_value("ETUDE_TRIGGER_MODE", &mode)?;
        }
        if let Some(timeout) = lookup("ETUDE_TIMEOUT_MS") {
            cfg.timeout_ms = parse_value("ETUDE_TIMEOUT_MS", &timeout)?;
        }
        if let Some(linger) = lookup("ETUDE_LINGER") {
            cfg.linger = parse_bool("ETUDE_LINGER", &linger)?;
        }
        if let Some(workers) = lookup("ETUDE_WORKERS") {
            cfg.workers = parse_value("ETUDE_WORKERS", &workers)?;
        }
        if let Some(max) = lookup("ETUDE_MAX_CONNECTIONS") {
            cfg.max_connections = parse_value("ETUDE_MAX_CONNECTIONS", &max)?;
        }
        if let Some(dir) = lookup("ETUDE_STATIC_DIR") {
            cfg.static_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("ETUDE_LOG_LEVEL") {
            cfg.log.level = level;
        }
        if let Some(sink) = lookup("ETUDE_LOG_SINK") {
            cfg.log.sink = sink.parse()?;
        }
        if let Some(dir) = lookup("ETUDE_LOG_DIR") {
            cfg.log.dir = PathBuf::from(dir);
        }
        if let Some(cap) = lookup("ETUDE_LOG_QUEUE") {
            cfg.log.queue_capacity = parse_value("ETUDE_LOG_QUEUE", &cap)?;
        }

        Ok(cfg)
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if self.port < 1024 {
            return Err(EtudeError::Config(format!(
                "port {} outside 1024-65535",
                self.port
            )));
        }
        if self.workers == 0 {
            return Err(EtudeError::Config("workers must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.log.queue_capacity == 0 {
            return Err(EtudeError::Config(
                "log queue capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn trigger(&self) -> TriggerMode {
        TriggerMode::from_choice(self.trigger_mode)
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> EtudeResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| EtudeError::Config(format!("{key}: cannot parse {raw:?}")))
}

fn parse_bool(key: &str, raw: &str) -> EtudeResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(EtudeError::Config(format!("{key}: expected a boolean, got {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.timeout_ms, 60_000);
        assert!(cfg.linger);
        assert_eq!(cfg.max_connections, 65535);
        assert!(cfg.workers >= 1);
        assert!(cfg.static_dir.ends_with("static"));
        assert_eq!(cfg.log.sink, LogSink::Terminal);
        assert_eq!(cfg.trigger(), TriggerMode::from_choice(3));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("ETUDE_PORT", "9006"),
            ("ETUDE_TRIGGER_MODE", "1"),
            ("ETUDE_LINGER", "off"),
            ("ETUDE_WORKERS", "2"),
            ("ETUDE_LOG_SINK", "Both"),
            ("ETUDE_STATIC_DIR", "/srv/www"),
        ]))
        .unwrap();

        assert_eq!(cfg.server_addr(), "0.0.0.0:9006");
        assert_eq!(
            cfg.trigger(),
            TriggerMode {
                listen_edge: true,
                conn_edge: false
            }
        );
        assert!(!cfg.linger);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.log.sink, LogSink::Both);
        assert_eq!(cfg.static_dir, PathBuf::from("/srv/www"));
    }

    #[test]
    fn test_trigger_matrix() {
        assert_eq!(TriggerMode::from_choice(0), TriggerMode { listen_edge: false, conn_edge: false });
        assert_eq!(TriggerMode::from_choice(2), TriggerMode { listen_edge: false, conn_edge: true });
        assert_eq!(TriggerMode::from_choice(9), TriggerMode { listen_edge: true, conn_edge: true });
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("ETUDE_PORT", "http")])),
            Err(EtudeError::Config(_))
        ));
        assert!(Config::from_lookup(lookup(&[("ETUDE_LINGER", "maybe")])).is_err());
        assert!(Config::from_lookup(lookup(&[("ETUDE_LOG_SINK", "syslog")])).is_err());

        let low = Config::from_lookup(lookup(&[("ETUDE_PORT", "80")])).unwrap();
        assert!(low.validate().is_err());
        let none = Config::from_lookup(lookup(&[("ETUDE_WORKERS", "0")])).unwrap();
        assert!(none.validate().is_err());
    }
}
