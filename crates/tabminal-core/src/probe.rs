//! Foreground process probing
//!
//! Each session runs a periodic task that walks from the PTY leader down to
//! its deepest descendant and reads that process's argv, environment, and
//! working directory. Only changes are broadcast as `meta`. Probe failures
//! are swallowed; a broken probe never affects the session.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::session::Session;

/// OS process-tree introspection, one implementation per platform family.
pub trait ProcessIntrospection: Send + Sync {
    /// Deepest descendant of `pid`, walking the largest child PID at each
    /// level. None when `pid` has no children.
    fn deepest_descendant(&self, pid: u32) -> Option<u32>;
    fn args(&self, pid: u32) -> Vec<String>;
    fn env(&self, pid: u32) -> Vec<String>;
    fn cwd(&self, pid: u32) -> Option<PathBuf>;
}

/// Introspection over the sysinfo process table; covers Linux and macOS.
pub struct SysinfoIntrospection {
    system: std::sync::Mutex<System>,
}

impl SysinfoIntrospection {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoIntrospection {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessIntrospection for SysinfoIntrospection {
    fn deepest_descendant(&self, pid: u32) -> Option<u32> {
        let mut system = self.system.lock().ok()?;
        system.refresh_processes();

        let mut current = Pid::from_u32(pid);
        let mut found = None;
        loop {
            let child = system
                .processes()
                .iter()
                .filter(|(_, p)| p.parent() == Some(current))
                .map(|(pid, _)| *pid)
                .max();
            match child {
                Some(next) => {
                    found = Some(next.as_u32());
                    current = next;
                }
                None => break,
            }
        }
        found
    }

    fn args(&self, pid: u32) -> Vec<String> {
        self.system
            .lock()
            .ok()
            .and_then(|system| {
                system
                    .process(Pid::from_u32(pid))
                    .map(|p| p.cmd().to_vec())
            })
            .unwrap_or_default()
    }

    fn env(&self, pid: u32) -> Vec<String> {
        self.system
            .lock()
            .ok()
            .and_then(|system| {
                system
                    .process(Pid::from_u32(pid))
                    .map(|p| p.environ().to_vec())
            })
            .unwrap_or_default()
    }

    fn cwd(&self, pid: u32) -> Option<PathBuf> {
        self.system.lock().ok().and_then(|system| {
            system.process(Pid::from_u32(pid)).and_then(|p| {
                let cwd = p.cwd();
                if cwd.as_os_str().is_empty() {
                    None
                } else {
                    Some(cwd.to_path_buf())
                }
            })
        })
    }
}

/// What one probe tick derived for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub title: String,
    pub env: String,
    pub cwd: Option<String>,
}

/// Derive title/env/cwd for the foreground process of `leader_pid`. Falls
/// back to the shell basename when no descendant exists.
pub fn probe(
    introspection: &dyn ProcessIntrospection,
    leader_pid: u32,
    shell: &Path,
) -> ProbeOutcome {
    let shell_title = shell
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| shell.to_string_lossy().into_owned());

    let Some(foreground) = introspection.deepest_descendant(leader_pid) else {
        return ProbeOutcome {
            title: shell_title,
            env: String::new(),
            cwd: None,
        };
    };

    let args = introspection.args(foreground);
    let title = match args.split_first() {
        Some((first, rest)) => {
            let base = Path::new(first)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| first.clone());
            if rest.is_empty() {
                base
            } else {
                format!("{} {}", base, rest.join(" "))
            }
        }
        None => shell_title,
    };

    ProbeOutcome {
        title,
        env: introspection.env(foreground).join("\n"),
        cwd: introspection
            .cwd(foreground)
            .map(|p| p.to_string_lossy().into_owned()),
    }
}

/// Per-session prober task. Holds only a weak session reference; ends when
/// the session goes away or the task is aborted by dispose.
pub(crate) fn spawn_prober(
    session: Weak<Session>,
    introspection: Arc<dyn ProcessIntrospection>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            let Some(pid) = session.pid() else {
                continue;
            };
            let shell = session.shell().to_path_buf();
            let intro = introspection.clone();
            let outcome = tokio::task::spawn_blocking(move || probe(intro.as_ref(), pid, &shell))
                .await;
            match outcome {
                Ok(outcome) => {
                    trace!(session = %session.id(), title = %outcome.title, "probe tick");
                    session
                        .apply_probe(outcome.title, outcome.env, outcome.cwd)
                        .await;
                }
                Err(_) => {
                    // Probe panicked or was cancelled; skip this tick.
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Introspection over a fixed fake process table.
    struct FakeIntrospection {
        children: HashMap<u32, Vec<u32>>,
        args: HashMap<u32, Vec<String>>,
        env: HashMap<u32, Vec<String>>,
        cwd: HashMap<u32, PathBuf>,
    }

    impl ProcessIntrospection for FakeIntrospection {
        fn deepest_descendant(&self, pid: u32) -> Option<u32> {
            let mut current = pid;
            let mut found = None;
            while let Some(max) = self
                .children
                .get(&current)
                .and_then(|c| c.iter().max())
                .copied()
            {
                found = Some(max);
                current = max;
            }
            found
        }
        fn args(&self, pid: u32) -> Vec<String> {
            self.args.get(&pid).cloned().unwrap_or_default()
        }
        fn env(&self, pid: u32) -> Vec<String> {
            self.env.get(&pid).cloned().unwrap_or_default()
        }
        fn cwd(&self, pid: u32) -> Option<PathBuf> {
            self.cwd.get(&pid).cloned()
        }
    }

    #[test]
    fn probe_reports_the_deepest_descendant() {
        let fake = FakeIntrospection {
            children: HashMap::from([(100, vec![101, 150]), (150, vec![151])]),
            args: HashMap::from([(
                151,
                vec!["/usr/bin/vim".to_string(), "notes.txt".to_string()],
            )]),
            env: HashMap::from([(151, vec!["EDITOR=vim".to_string(), "LANG=C".to_string()])]),
            cwd: HashMap::from([(151, PathBuf::from("/home/u/project"))]),
        };

        let outcome = probe(&fake, 100, Path::new("/bin/bash"));
        assert_eq!(outcome.title, "vim notes.txt");
        assert_eq!(outcome.env, "EDITOR=vim\nLANG=C");
        assert_eq!(outcome.cwd.as_deref(), Some("/home/u/project"));
    }

    #[test]
    fn probe_defaults_to_the_shell_basename() {
        let fake = FakeIntrospection {
            children: HashMap::new(),
            args: HashMap::new(),
            env: HashMap::new(),
            cwd: HashMap::new(),
        };
        let outcome = probe(&fake, 42, Path::new("/usr/local/bin/zsh"));
        assert_eq!(outcome.title, "zsh");
        assert_eq!(outcome.env, "");
        assert_eq!(outcome.cwd, None);
    }

    #[test]
    fn sysinfo_introspection_sees_this_process_args() {
        let intro = SysinfoIntrospection::new();
        // Force a refresh through the descendant walk, then read our own
        // argv; the test binary path is always argv[0].
        let _ = intro.deepest_descendant(std::process::id());
        let args = intro.args(std::process::id());
        assert!(!args.is_empty());
    }
}
