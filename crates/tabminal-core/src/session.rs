//! Terminal session
//!
//! Owns one PTY, its stream interpreter, the bounded history ring, and the
//! set of attached clients. All mutable state sits behind one async mutex;
//! the three event sources (PTY data, client frames, prober ticks)
//! serialize on it. Broadcasting is best-effort per client over bounded
//! queues so a slow client never backpressures the PTY reader.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tabminal_types::{
    AttachStatus, ClientFrame, ExecutionRecord, ServerFrame, SessionMeta, SessionSummary,
};

use crate::config::CoreConfig;
use crate::history::HistoryRing;
use crate::integration::IntegrationFiles;
use crate::interpreter::StreamInterpreter;
use crate::probe::ProcessIntrospection;
use crate::pty::{Pty, PtyEvent};
use crate::registry::RegistryCmd;

/// Completed execution records kept per session.
const MAX_EXECUTIONS: usize = 100;

/// Largest accepted terminal dimension.
const MAX_DIMENSION: i64 = 500;

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    shell: PathBuf,
    initial_cwd: PathBuf,
    pty: Pty,
    integration: IntegrationFiles,
    registry_tx: mpsc::UnboundedSender<RegistryCmd>,
    state: Mutex<SessionState>,
    next_client_id: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct SessionState {
    interpreter: StreamInterpreter,
    history: HistoryRing,
    clients: HashMap<u64, mpsc::Sender<ServerFrame>>,
    title: String,
    cwd: String,
    env: String,
    cols: u16,
    rows: u16,
    executions: VecDeque<ExecutionRecord>,
    last_execution: Option<ExecutionRecord>,
    closed: bool,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        shell: PathBuf,
        initial_cwd: PathBuf,
        cols: u16,
        rows: u16,
        pty: Pty,
        integration: IntegrationFiles,
        registry_tx: mpsc::UnboundedSender<RegistryCmd>,
        config: &CoreConfig,
    ) -> Arc<Self> {
        let title = shell
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| shell.to_string_lossy().into_owned());
        let cwd = initial_cwd.to_string_lossy().into_owned();

        Arc::new(Self {
            id,
            created_at: Utc::now(),
            shell,
            initial_cwd,
            pty,
            integration,
            registry_tx,
            state: Mutex::new(SessionState {
                interpreter: StreamInterpreter::new(),
                history: HistoryRing::new(config.history_limit),
                clients: HashMap::new(),
                title,
                cwd,
                env: String::new(),
                cols,
                rows,
                executions: VecDeque::new(),
                last_execution: None,
                closed: false,
                exit_code: None,
                exit_signal: None,
            }),
            next_client_id: AtomicU64::new(1),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the PTY event loop and the foreground prober. Called once,
    /// after the session is registered.
    pub(crate) fn start(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<PtyEvent>,
        introspection: Arc<dyn ProcessIntrospection>,
        probe_interval: std::time::Duration,
    ) {
        let session = self.clone();
        let event_loop = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Data(chunk) => session.on_data(&chunk).await,
                    PtyEvent::Exit { code, signal } => {
                        session.on_exit(code, signal).await;
                        break;
                    }
                }
            }
        });
        let prober = crate::probe::spawn_prober(
            Arc::downgrade(self),
            introspection,
            probe_interval,
        );
        self.tasks.lock().expect("task list poisoned").extend([event_loop, prober]);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn shell(&self) -> &std::path::Path {
        &self.shell
    }

    pub fn initial_cwd(&self) -> &std::path::Path {
        &self.initial_cwd
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn last_execution(&self) -> Option<ExecutionRecord> {
        self.state.lock().await.last_execution.clone()
    }

    /// Attach a client. The greeting (snapshot, meta, status) is enqueued
    /// atomically under the state lock, so nothing emitted afterwards can
    /// precede it on this client's queue.
    pub async fn attach(&self, tx: mpsc::Sender<ServerFrame>) -> u64 {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;

        let snapshot = String::from_utf8_lossy(&state.history.snapshot()).into_owned();
        let _ = tx.try_send(ServerFrame::Snapshot { data: snapshot });
        let _ = tx.try_send(ServerFrame::Meta {
            meta: state.meta(),
        });
        let status = if state.closed {
            AttachStatus::Terminated
        } else {
            AttachStatus::Ready
        };
        let _ = tx.try_send(ServerFrame::Status {
            status,
            code: state.exit_code,
            signal: state.exit_signal,
        });

        state.clients.insert(client_id, tx);
        debug!(session = %self.id, client = client_id, "client attached");
        client_id
    }

    /// Detach a client. The transport owns the connection; this only drops
    /// the session's sender.
    pub async fn detach(&self, client_id: u64) {
        let mut state = self.state.lock().await;
        if state.clients.remove(&client_id).is_some() {
            debug!(session = %self.id, client = client_id, "client detached");
        }
    }

    /// Handle one inbound client frame. Malformed frames never reach this
    /// point; they are dropped at the transport parse step.
    pub async fn handle_client_frame(&self, client_id: u64, frame: ClientFrame) {
        match frame {
            ClientFrame::Input { data } => {
                if self.state.lock().await.closed {
                    debug!(session = %self.id, "input to closed session dropped");
                    return;
                }
                if let Err(e) = self.pty.write(data.into_bytes()).await {
                    debug!(session = %self.id, "PTY write failed: {}", e);
                }
            }
            ClientFrame::Resize { cols, rows } => {
                if !(1..=MAX_DIMENSION).contains(&cols) || !(1..=MAX_DIMENSION).contains(&rows) {
                    debug!(session = %self.id, cols, rows, "ignoring invalid resize");
                    return;
                }
                // Every client resize drives the registry's global geometry:
                // the UI models one physical viewport shared by all tabs.
                let _ = self.registry_tx.send(RegistryCmd::ResizeAll {
                    cols: cols as u16,
                    rows: rows as u16,
                });
            }
            ClientFrame::Ping => {
                let state = self.state.lock().await;
                if let Some(tx) = state.clients.get(&client_id) {
                    let _ = tx.try_send(ServerFrame::Pong);
                }
            }
        }
    }

    /// Apply a registry-driven resize and notify clients.
    pub(crate) async fn apply_resize(&self, cols: u16, rows: u16) {
        if let Err(e) = self.pty.resize(cols, rows).await {
            debug!(session = %self.id, "PTY resize failed: {}", e);
        }
        let mut state = self.state.lock().await;
        state.cols = cols;
        state.rows = rows;
        let frame = ServerFrame::Meta { meta: state.meta() };
        state.broadcast(frame);
    }

    /// Merge prober findings; broadcast meta only on change.
    pub(crate) async fn apply_probe(&self, title: String, env: String, cwd: Option<String>) {
        let mut state = self.state.lock().await;
        let mut changed = false;
        if state.title != title {
            state.title = title;
            changed = true;
        }
        if state.env != env {
            state.env = env;
            changed = true;
        }
        if let Some(cwd) = cwd {
            if state.cwd != cwd {
                state.cwd = cwd;
                changed = true;
            }
        }
        if changed {
            let frame = ServerFrame::Meta { meta: state.meta() };
            state.broadcast(frame);
        }
    }

    pub async fn summary(&self) -> SessionSummary {
        let state = self.state.lock().await;
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            shell: self.shell.to_string_lossy().into_owned(),
            cwd: state.cwd.clone(),
            title: state.title.clone(),
            env: state.env.clone(),
            cols: state.cols,
            rows: state.rows,
            executions: state.executions.iter().cloned().collect(),
        }
    }

    /// Deliver a signal to the PTY leader.
    pub(crate) fn kill(&self, signal: i32) {
        self.pty.kill(signal);
    }

    /// Stop the prober and event loop, detach all clients (their transports
    /// stay open), and remove the integration files.
    pub(crate) async fn dispose(&self) {
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        let mut state = self.state.lock().await;
        state.closed = true;
        state.clients.clear();
        drop(state);
        self.integration.cleanup();
        debug!(session = %self.id, "session disposed");
    }

    async fn on_data(&self, chunk: &[u8]) {
        let mut state = self.state.lock().await;
        let outcome = state.interpreter.feed(chunk);

        if !outcome.cleaned.is_empty() {
            state.history.push(&outcome.cleaned);
            let frame = ServerFrame::Output {
                data: String::from_utf8_lossy(&outcome.cleaned).into_owned(),
            };
            state.broadcast(frame);
        }

        let mut changed = false;
        if let Some(title) = outcome.title {
            if state.title != title {
                state.title = title;
                changed = true;
            }
        }
        if let Some(cwd) = outcome.cwd {
            if state.cwd != cwd {
                state.cwd = cwd;
                changed = true;
            }
        }
        if changed {
            let frame = ServerFrame::Meta { meta: state.meta() };
            state.broadcast(frame);
        }

        for record in outcome.records {
            info!(
                session = %self.id,
                command = ?record.command,
                exit_code = ?record.exit_code,
                duration_ms = record.duration_ms,
                "captured execution"
            );
            state.executions.push_back(record.clone());
            while state.executions.len() > MAX_EXECUTIONS {
                state.executions.pop_front();
            }
            state.last_execution = Some(record);
        }
    }

    async fn on_exit(&self, code: Option<i32>, signal: Option<i32>) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.exit_code = code;
            state.exit_signal = signal;
            state.broadcast(ServerFrame::Status {
                status: AttachStatus::Terminated,
                code,
                signal,
            });
        }
        info!(session = %self.id, ?code, "PTY exited");
        self.integration.cleanup();
        let _ = self.registry_tx.send(RegistryCmd::SessionExited {
            id: self.id.clone(),
        });
    }
}

impl SessionState {
    fn meta(&self) -> SessionMeta {
        SessionMeta {
            title: self.title.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            cols: self.cols,
            rows: self.rows,
        }
    }

    /// Best-effort fanout: a full queue drops the frame for that client
    /// only, preserving per-client ordering for what does get through.
    fn broadcast(&self, frame: ServerFrame) {
        for (client_id, tx) in &self.clients {
            if tx.try_send(frame.clone()).is_err() {
                debug!(client = client_id, "client queue full, dropping frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    struct Harness {
        session: Arc<Session>,
        input_rx: mpsc::Receiver<Vec<u8>>,
        registry_rx: mpsc::UnboundedReceiver<RegistryCmd>,
    }

    fn harness_with_config(config: CoreConfig) -> Harness {
        let (pty, input_rx, _resize_rx) = Pty::stub();
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "feedbeef".to_string(),
            PathBuf::from("/bin/bash"),
            PathBuf::from("/tmp"),
            80,
            24,
            pty,
            IntegrationFiles::none(),
            registry_tx,
            &config,
        );
        Harness {
            session,
            input_rx,
            registry_rx,
        }
    }

    fn harness() -> Harness {
        harness_with_config(CoreConfig::default())
    }

    fn client() -> (mpsc::Sender<ServerFrame>, mpsc::Receiver<ServerFrame>) {
        mpsc::channel(256)
    }

    #[tokio::test]
    async fn attach_greeting_is_snapshot_meta_status() {
        let h = harness();
        h.session.on_data(b"chunk one ").await;
        h.session.on_data(b"chunk two").await;

        let (tx, mut rx) = client();
        h.session.attach(tx).await;

        match rx.recv().await.unwrap() {
            ServerFrame::Snapshot { data } => assert_eq!(data, "chunk one chunk two"),
            other => panic!("expected snapshot, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerFrame::Meta { meta } => {
                assert_eq!(meta.cols, 80);
                assert_eq!(meta.title, "bash");
            }
            other => panic!("expected meta, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerFrame::Status { status, .. } => assert_eq!(status, AttachStatus::Ready),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_after_attach_flows_to_the_client() {
        let h = harness();
        let (tx, mut rx) = client();
        h.session.attach(tx).await;
        // Drain the greeting.
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        h.session.on_data(b"live bytes").await;
        match rx.recv().await.unwrap() {
            ServerFrame::Output { data } => assert_eq!(data, "live bytes"),
            other => panic!("expected output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_resize_is_ignored_and_valid_resize_routes_to_registry() {
        let mut h = harness();
        h.session
            .handle_client_frame(0, ClientFrame::Resize { cols: -5, rows: 40 })
            .await;
        h.session
            .handle_client_frame(0, ClientFrame::Resize { cols: 80, rows: 501 })
            .await;
        assert!(h.registry_rx.try_recv().is_err());

        h.session
            .handle_client_frame(0, ClientFrame::Resize { cols: 200, rows: 40 })
            .await;
        match h.registry_rx.try_recv().unwrap() {
            RegistryCmd::ResizeAll { cols, rows } => {
                assert_eq!((cols, rows), (200, 40));
            }
            other => panic!("expected resize command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_reaches_the_pty_until_the_session_closes() {
        let mut h = harness();
        h.session
            .handle_client_frame(
                0,
                ClientFrame::Input {
                    data: "ls\n".to_string(),
                },
            )
            .await;
        assert_eq!(h.input_rx.recv().await.unwrap(), b"ls\n");

        h.session.on_exit(Some(0), None).await;
        h.session
            .handle_client_frame(
                0,
                ClientFrame::Input {
                    data: "too late\n".to_string(),
                },
            )
            .await;
        assert!(h.input_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn exit_broadcasts_terminated_and_later_attaches_see_it() {
        let h = harness();
        let (tx, mut rx) = client();
        h.session.attach(tx).await;
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        h.session.on_exit(Some(2), None).await;
        match rx.recv().await.unwrap() {
            ServerFrame::Status { status, code, .. } => {
                assert_eq!(status, AttachStatus::Terminated);
                assert_eq!(code, Some(2));
            }
            other => panic!("expected status, got {other:?}"),
        }

        let (tx2, mut rx2) = client();
        h.session.attach(tx2).await;
        rx2.recv().await.unwrap(); // snapshot
        rx2.recv().await.unwrap(); // meta
        match rx2.recv().await.unwrap() {
            ServerFrame::Status { status, .. } => assert_eq!(status, AttachStatus::Terminated),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_answers_only_the_sender() {
        let h = harness();
        let (tx_a, mut rx_a) = client();
        let (tx_b, mut rx_b) = client();
        let id_a = h.session.attach(tx_a).await;
        h.session.attach(tx_b).await;
        for _ in 0..3 {
            rx_a.recv().await.unwrap();
            rx_b.recv().await.unwrap();
        }

        h.session.handle_client_frame(id_a, ClientFrame::Ping).await;
        assert!(matches!(rx_a.recv().await.unwrap(), ServerFrame::Pong));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn history_stays_within_the_configured_limit() {
        let config = CoreConfig {
            history_limit: 16,
            ..CoreConfig::default()
        };
        let h = harness_with_config(config);
        h.session.on_data(b"0123456789abcdef").await;
        h.session.on_data(b"X").await;

        let (tx, mut rx) = client();
        h.session.attach(tx).await;
        match rx.recv().await.unwrap() {
            ServerFrame::Snapshot { data } => {
                assert_eq!(data.len(), 16);
                assert!(data.ends_with('X'));
                assert!(data.starts_with('1'));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn executions_are_capped_fifo() {
        let h = harness();
        let prompt = b"\x1b]1337;TabminalPrompt\x07";
        for i in 0..105 {
            h.session.on_data(prompt).await;
            h.session
                .on_data(format!("cmd{i}\nout{i}\n").as_bytes())
                .await;
            let marker = format!(
                "\x1b]1337;ExitCode=0;CommandB64={}\x07",
                BASE64.encode(format!("cmd{i}"))
            );
            h.session.on_data(marker.as_bytes()).await;
        }

        let summary = h.session.summary().await;
        assert_eq!(summary.executions.len(), 100);
        assert_eq!(summary.executions[0].command.as_deref(), Some("cmd5"));
        let last = h.session.last_execution().await.unwrap();
        assert_eq!(last.command.as_deref(), Some("cmd104"));
    }

    #[tokio::test]
    async fn slow_client_drops_frames_without_blocking() {
        let h = harness();
        let (tx, mut rx) = mpsc::channel(4);
        h.session.attach(tx).await;

        // Queue is 4 deep and the greeting used 3 slots; pushes beyond the
        // capacity must not block the data path.
        for _ in 0..20 {
            h.session.on_data(b"spam").await;
        }
        // The client still sees its greeting first, in order.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::Snapshot { .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::Meta { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::Status { .. }
        ));
    }
}
