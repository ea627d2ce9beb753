// src/logging.rs
//! Tracing subscriber setup.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from
//! [`LogConfig::level`]:
//!
//! ```bash
//! RUST_LOG=etude_core=debug etude --port 9006
//! ```
//!
//! The file sink never does disk I/O on the logging thread. Formatted records
//! go through a bounded channel to a single `etude-log` writer thread; when
//! the channel is full the producer blocks until the writer catches up.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogConfig, LogSink};
use crate::error::{EtudeError, EtudeResult};

pub const LOG_FILE_NAME: &str = "etude.log";

enum Record {
    Line(Vec<u8>),
    Shutdown,
}

/// `MakeWriter` handing each formatted record to the writer thread.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: SyncSender<Record>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Record::Line(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log writer stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ChannelWriter {
    type Writer = ChannelWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keeps the file writer alive. Dropping it flushes pending records and
/// joins the writer thread.
pub struct LogGuard {
    tx: SyncSender<Record>,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl LogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Record::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Opens `<dir>/etude.log` for appending and starts the writer thread.
pub fn spawn_file_writer(dir: &Path, capacity: usize) -> EtudeResult<(ChannelWriter, LogGuard)> {
    fs::create_dir_all(dir)
        .map_err(|e| EtudeError::Logging(format!("create {}: {e}", dir.display())))?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| EtudeError::Logging(format!("open {}: {e}", path.display())))?;

    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let handle = thread::Builder::new()
        .name("etude-log".to_string())
        .spawn(move || write_loop(rx, BufWriter::new(file)))?;

    Ok((
        ChannelWriter { tx: tx.clone() },
        LogGuard {
            tx,
            handle: Some(handle),
            path,
        },
    ))
}

fn write_loop(rx: Receiver<Record>, mut out: BufWriter<File>) {
    let mut pending = rx.recv().ok();
    while let Some(record) = pending.take() {
        match record {
            Record::Line(line) => {
                if out.write_all(&line).is_err() {
                    break;
                }
            }
            Record::Shutdown => break,
        }
        // Flush whenever the queue runs dry.
        pending = match rx.try_recv() {
            Ok(next) => Some(next),
            Err(TryRecvError::Empty) => {
                let _ = out.flush();
                rx.recv().ok()
            }
            Err(TryRecvError::Disconnected) => None,
        };
    }
    let _ = out.flush();
}

/// Installs the global subscriber for the configured sink. The returned guard
/// must live as long as file logging is wanted.
pub fn init_logging(cfg: &LogConfig) -> EtudeResult<Option<LogGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .map_err(|e| EtudeError::Logging(e.to_string()))?;

    let terminal = matches!(cfg.sink, LogSink::Terminal | LogSink::Both).then(fmt::layer);

    let (file_layer, guard) = if matches!(cfg.sink, LogSink::File | LogSink::Both) {
        let (writer, guard) = spawn_file_writer(&cfg.dir, cfg.queue_capacity)?;
        let layer = fmt::layer()
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(terminal)
        .with(file_layer)
        .try_init()
        .map_err(|e| EtudeError::Logging(e.to_string()))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_writer_persists_lines_on_drop() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("nested");
        let (mut writer, guard) = spawn_file_writer(&log_dir, 2).unwrap();
        let path = guard.path().to_path_buf();

        for i in 0..50 {
            writer.write_all(format!("line {i}\n").as_bytes()).unwrap();
        }
        drop(guard);

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[49], "line 49");
    }

    #[test]
    fn test_write_after_shutdown_fails() {
        let dir = TempDir::new().unwrap();
        let (mut writer, guard) = spawn_file_writer(dir.path(), 4).unwrap();
        drop(guard);
        assert!(writer.write_all(b"late\n").is_err());
    }
}
