use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use etude_core::{AuthService, Config, LogSink, MemoryAuth, Server, init_logging};
use tracing::info;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Epoll-driven static file server with idle timeouts and form login")]
#[command(version)]
struct Cli {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Listen port (1024-65535)
    #[arg(short, long)]
    port: Option<u16>,

    /// 0 = LT/LT, 1 = ET listen, 2 = ET connections, 3 = ET/ET
    #[arg(short = 'm', long)]
    trigger_mode: Option<u8>,

    /// Idle timeout in milliseconds, 0 disables eviction
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// SO_LINGER on close
    #[arg(long)]
    linger: Option<bool>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Live connection cap
    #[arg(long)]
    max_connections: Option<usize>,

    /// Directory served as the site root
    #[arg(short, long)]
    static_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// terminal, file or both
    #[arg(long)]
    log_sink: Option<LogSink>,

    /// Directory for the file sink
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Seed account, as name:password (repeatable)
    #[arg(long = "user", value_name = "NAME:PASSWORD")]
    users: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.trigger_mode {
            config.trigger_mode = mode;
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout_ms = timeout;
        }
        if let Some(linger) = self.linger {
            config.linger = linger;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(dir) = &self.static_dir {
            config.static_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(sink) = self.log_sink {
            config.log.sink = sink;
        }
        if let Some(dir) = &self.log_dir {
            config.log.dir = dir.clone();
        }
    }

    fn seed_users(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut users = Vec::with_capacity(self.users.len());
        for entry in &self.users {
            let Some((name, password)) = entry.split_once(':') else {
                bail!("--user expects NAME:PASSWORD, got {entry:?}");
            };
            users.push((name.to_string(), password.to_string()));
        }
        Ok(users)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("loading configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    let _log_guard = init_logging(&config.log).context("initializing logging")?;

    let auth: Arc<dyn AuthService> = Arc::new(MemoryAuth::with_users(cli.seed_users()?));
    let server = Server::new(&config, auth).context("starting server")?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || handle.shutdown()).context("installing Ctrl-C handler")?;

    info!(port = server.local_port(), "ready, press Ctrl-C to stop");
    server.run()?;
    Ok(())
}
