//! Error types for the tabminal core

use thiserror::Error;

/// Main error type for the broker core
#[derive(Error, Debug)]
pub enum TabminalError {
    #[error("PTY spawn failed: {0}")]
    Spawn(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Shell integration error: {0}")]
    Integration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TabminalError>;
