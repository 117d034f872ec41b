//! Session summaries and execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed command, recovered from the PTY stream by the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Decoded command text from the exit marker, None when undecodable.
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    /// The echoed command line(s) as the shell emitted them, including
    /// continuation prompts.
    pub input: String,
    /// Command stdout/stderr between end-of-echo and the exit marker,
    /// sanitized for display.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Per-session summary returned by the registry's list operation and the
/// REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub shell: String,
    pub cwd: String,
    pub title: String,
    pub env: String,
    pub cols: u16,
    pub rows: u16,
    pub executions: Vec<ExecutionRecord>,
}
