//! Client/session wire protocol
//!
//! One JSON object per frame on a duplex string-message channel. A freshly
//! attached client always receives `snapshot`, `meta`, `status` in that
//! order before any live `output`.

use serde::{Deserialize, Serialize};

/// Client -> session frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Raw keystrokes, written verbatim to the PTY.
    Input { data: String },
    /// Request a terminal resize. Dimensions are validated server-side;
    /// invalid requests are ignored.
    Resize { cols: i64, rows: i64 },
    /// Application-level keepalive; answered with `pong` on the same client.
    Ping,
}

/// Session -> client frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Full history replay, always the first frame after attach.
    Snapshot { data: String },
    /// Session metadata, after the snapshot and on any change.
    Meta {
        #[serde(flatten)]
        meta: SessionMeta,
    },
    /// A cleaned PTY output chunk.
    Output { data: String },
    /// Session liveness; `terminated` is final and carries the exit code
    /// when known.
    Status {
        status: AttachStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// Reply to a client `ping`.
    Pong,
}

/// Metadata snapshot broadcast in `meta` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub title: String,
    pub cwd: String,
    pub env: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachStatus {
    Ready,
    Terminated,
}
