//! PTY adapter
//!
//! Sole owner of OS pseudo-terminal resources. Spawns the shell on a fresh
//! PTY pair, bridges the blocking master reader/writer into async channels,
//! and reports data and exit through a single event stream. Everything else
//! in the crate talks to the PTY only through [`Pty`].

use bytes::Bytes;
use portable_pty::{CommandBuilder, NativePtySystem, PtySize, PtySystem};
use std::io::{Read, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Result, TabminalError};

#[cfg(unix)]
pub const SIGHUP: i32 = libc::SIGHUP;
#[cfg(not(unix))]
pub const SIGHUP: i32 = 1;

#[derive(Debug, Clone)]
pub struct PtySpawn {
    pub shell: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// Events from the PTY's single logical producer. `Exit` is final; no
/// `Data` follows it.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    Data(Bytes),
    Exit { code: Option<i32>, signal: Option<i32> },
}

/// Handle to a live pseudo-terminal.
pub struct Pty {
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    pid: Option<u32>,
}

impl Pty {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write client keystrokes to the shell. Fails once the PTY is gone.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| TabminalError::SessionClosed)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| TabminalError::SessionClosed)
    }

    /// Deliver a signal to the shell process.
    pub fn kill(&self, signal: i32) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }

    #[cfg(test)]
    pub(crate) fn stub() -> (Self, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<(u16, u16)>) {
        let (input_tx, input_rx) = mpsc::channel(64);
        let (resize_tx, resize_rx) = mpsc::channel(8);
        (
            Self {
                input_tx,
                resize_tx,
                pid: None,
            },
            input_rx,
            resize_rx,
        )
    }
}

/// Spawn a shell on a new PTY. Returns the handle and the event stream;
/// dropping the receiver detaches from the PTY without killing it.
pub fn spawn(spec: PtySpawn) -> Result<(Pty, mpsc::Receiver<PtyEvent>)> {
    let pty_system = NativePtySystem::default();
    let pair = pty_system
        .openpty(PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TabminalError::Spawn(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&spec.shell);
    for arg in &spec.args {
        cmd.arg(arg);
    }
    cmd.cwd(&spec.cwd);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| TabminalError::Spawn(e.to_string()))?;
    let pid = child.process_id();

    // Closing our slave half lets the master reader see EOF when the shell
    // exits.
    let master = pair.master;
    drop(pair.slave);

    let mut reader = master
        .try_clone_reader()
        .map_err(|e| TabminalError::Spawn(e.to_string()))?;
    let mut writer = master
        .take_writer()
        .map_err(|e| TabminalError::Spawn(e.to_string()))?;

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(8);
    let (event_tx, event_rx) = mpsc::channel::<PtyEvent>(256);

    // Writer: client input, applied synchronously off the async runtime.
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    // Reader: blocking reads bridged into an async channel.
    let (read_tx, mut read_rx) = mpsc::channel::<std::io::Result<Bytes>>(256);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if read_tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = read_tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    // Driver: owns the master (for resize) and the child (for the final
    // wait); serializes data and exit onto one event stream.
    tokio::spawn(async move {
        let mut resize_open = true;
        loop {
            tokio::select! {
                read = read_rx.recv() => match read {
                    Some(Ok(data)) => {
                        // A gone subscriber is fine; keep draining so the
                        // shell does not block on a full PTY buffer.
                        let _ = event_tx.send(PtyEvent::Data(data)).await;
                    }
                    Some(Err(e)) => {
                        debug!("PTY read error: {}", e);
                        break;
                    }
                    None => break,
                },
                resize = resize_rx.recv(), if resize_open => match resize {
                    Some((cols, rows)) => {
                        if let Err(e) = master.resize(PtySize {
                            rows,
                            cols,
                            pixel_width: 0,
                            pixel_height: 0,
                        }) {
                            error!("PTY resize failed: {}", e);
                        }
                    }
                    None => resize_open = false,
                },
            }
        }

        let code = tokio::task::spawn_blocking(move || {
            let mut child = child;
            child.wait()
        })
        .await
            .ok()
            .and_then(|res| res.ok())
            .map(|status| status.exit_code() as i32);

        debug!("PTY exited with code {:?}", code);
        let _ = event_tx.send(PtyEvent::Exit { code, signal: None }).await;
        drop(master);
    });

    Ok((
        Pty {
            input_tx,
            resize_tx,
            pid,
        },
        event_rx,
    ))
}
