//! Session registry
//!
//! Central map of live sessions. Creation wires a session's exit back to
//! `remove` through a command channel, never through a direct reference, so
//! the registry owns sessions and sessions only hold a sender. The map
//! never stays empty outside `dispose`: removing the last session
//! immediately creates a replacement under the same lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use tabminal_types::SessionSummary;

use crate::config::CoreConfig;
use crate::error::{Result, TabminalError};
use crate::integration::ShellIntegration;
use crate::probe::{ProcessIntrospection, SysinfoIntrospection};
use crate::pty::{self, PtyEvent, PtySpawn};
use crate::session::Session;

/// Commands sessions route back to the registry.
#[derive(Debug)]
pub enum RegistryCmd {
    SessionExited { id: String },
    ResizeAll { cols: u16, rows: u16 },
}

pub struct SessionRegistry {
    config: CoreConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Last geometry chosen by any client; seeds new sessions.
    geometry: Mutex<(u16, u16)>,
    disposing: AtomicBool,
    cmd_tx: mpsc::UnboundedSender<RegistryCmd>,
    introspection: Arc<dyn ProcessIntrospection>,
}

impl SessionRegistry {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        Self::with_introspection(config, Arc::new(SysinfoIntrospection::new()))
    }

    pub fn with_introspection(
        config: CoreConfig,
        introspection: Arc<dyn ProcessIntrospection>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            geometry: Mutex::new((config.default_cols, config.default_rows)),
            config,
            sessions: RwLock::new(HashMap::new()),
            disposing: AtomicBool::new(false),
            cmd_tx,
            introspection,
        });
        tokio::spawn(Self::run_commands(Arc::downgrade(&registry), cmd_rx));
        registry
    }

    async fn run_commands(registry: Weak<Self>, mut rx: mpsc::UnboundedReceiver<RegistryCmd>) {
        while let Some(cmd) = rx.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            match cmd {
                RegistryCmd::SessionExited { id } => {
                    if let Err(e) = registry.remove(&id).await {
                        // Usually a session that was already removed by hand.
                        debug!("exit cleanup for {}: {}", id, e);
                    }
                }
                RegistryCmd::ResizeAll { cols, rows } => registry.resize_all(cols, rows).await,
            }
        }
    }

    /// Create and register a new session. Spawn failure leaves the registry
    /// unchanged.
    pub async fn create(&self) -> Result<Arc<Session>> {
        let (session, events) = self.build_session().await?;
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), session.clone());
        session.start(events, self.introspection.clone(), self.config.probe_interval);
        info!(session = %session.id(), shell = %self.config.shell.display(), "session created");
        Ok(session)
    }

    async fn build_session(&self) -> Result<(Arc<Session>, mpsc::Receiver<PtyEvent>)> {
        let id = Uuid::new_v4().simple().to_string();
        let integration = ShellIntegration::for_shell(&self.config.shell).install(&id)?;
        let (cols, rows) = *self.geometry.lock().await;

        let mut env = vec![("TERM".to_string(), "xterm-256color".to_string())];
        env.extend(integration.env.iter().cloned());

        let spec = PtySpawn {
            shell: self.config.shell.clone(),
            args: integration.args.clone(),
            cwd: self.config.cwd.clone(),
            env,
            cols,
            rows,
        };
        let (pty, events) = match pty::spawn(spec) {
            Ok(pair) => pair,
            Err(e) => {
                integration.cleanup();
                return Err(e);
            }
        };

        let session = Session::new(
            id,
            self.config.shell.clone(),
            self.config.cwd.clone(),
            cols,
            rows,
            pty,
            integration,
            self.cmd_tx.clone(),
            &self.config,
        );
        Ok((session, events))
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session. If the map would become empty while the registry
    /// is live, a replacement is created under the same lock so observers
    /// never see an empty registry.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let (removed, replacement) = {
            let mut sessions = self.sessions.write().await;
            let Some(removed) = sessions.remove(id) else {
                return Err(TabminalError::SessionNotFound(id.to_string()));
            };
            let mut replacement = None;
            if sessions.is_empty() && !self.disposing.load(Ordering::SeqCst) {
                match self.build_session().await {
                    Ok((session, events)) => {
                        sessions.insert(session.id().to_string(), session.clone());
                        replacement = Some((session, events));
                    }
                    Err(e) => error!("auto-respawn failed: {}", e),
                }
            }
            (removed, replacement)
        };

        removed.kill(pty::SIGHUP);
        removed.dispose().await;
        info!(session = %id, "session removed");

        if let Some((session, events)) = replacement {
            session.start(events, self.introspection.clone(), self.config.probe_interval);
            info!(session = %session.id(), "session auto-respawned");
        }
        Ok(())
    }

    /// Update the default geometry and resize every session. Each session
    /// broadcasts a `meta` to its clients.
    pub async fn resize_all(&self, cols: u16, rows: u16) {
        *self.geometry.lock().await = (cols, rows);
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in &sessions {
            session.apply_resize(cols, rows).await;
        }
        debug!(cols, rows, count = sessions.len(), "resized all sessions");
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Shut down: suppress auto-respawn, hang up every PTY, clear the map.
    pub async fn dispose(&self) {
        self.disposing.store(true, Ordering::SeqCst);
        let sessions: Vec<_> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.kill(pty::SIGHUP);
            session.dispose().await;
        }
        info!("registry disposed");
    }
}
