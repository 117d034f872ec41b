//! Core configuration
//!
//! The broker takes a plain config struct; the surrounding binary decides
//! where values come from (environment variables by default).

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the session broker.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Absolute path of the shell spawned into new sessions.
    pub shell: PathBuf,
    /// Directory new sessions start in.
    pub cwd: PathBuf,
    /// History ring capacity in bytes.
    pub history_limit: usize,
    /// Geometry used until a client picks one.
    pub default_cols: u16,
    pub default_rows: u16,
    /// Foreground prober tick interval.
    pub probe_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let shell = std::env::var("SHELL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/bin/bash"));
        let cwd = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));

        Self {
            shell,
            cwd,
            history_limit: 512 * 1024,
            default_cols: 80,
            default_rows: 24,
            probe_interval: Duration::from_secs(2),
        }
    }
}

impl CoreConfig {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(shell) = std::env::var("TABMINAL_SHELL") {
            if !shell.is_empty() {
                config.shell = PathBuf::from(shell);
            }
        }
        if let Ok(limit) = std::env::var("TABMINAL_HISTORY_LIMIT") {
            if let Ok(limit) = limit.parse::<usize>() {
                config.history_limit = limit;
            }
        }
        if let Ok(cwd) = std::env::var("TABMINAL_CWD") {
            if !cwd.is_empty() {
                config.cwd = PathBuf::from(cwd);
            }
        }

        config
    }
}
