// src/error.rs
use crate::http::ParseError;
use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Rejected or malformed configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// The connection table reached its configured maximum.
    #[error("Connection table is full ({0} live connections)")]
    Capacity(usize),

    /// The log sink could not be created or installed.
    #[error("Logging error: {0}")]
    Logging(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
