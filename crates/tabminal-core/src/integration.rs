//! Shell integration
//!
//! Synthesizes a per-session rc file that makes bash or zsh emit the
//! tabminal-private markers: a prompt marker at the end of every rendered
//! prompt, and an exit marker (exit status + base64 command) before the
//! next prompt. The user's own rc is sourced first so their customizations
//! survive. Unknown shells are spawned plainly; execution records are then
//! unavailable for that session only.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, TabminalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellIntegration {
    Bash,
    Zsh,
    None,
}

impl ShellIntegration {
    /// Pick the integration variant from the shell basename.
    pub fn for_shell(shell: &Path) -> Self {
        match shell.file_name().and_then(|n| n.to_str()) {
            Some("bash") => Self::Bash,
            Some("zsh") => Self::Zsh,
            _ => Self::None,
        }
    }

    /// Materialize the integration files for one session. The returned
    /// struct carries the extra spawn arguments/environment and owns the
    /// temp paths for later cleanup.
    pub fn install(&self, session_id: &str) -> Result<IntegrationFiles> {
        match self {
            Self::Bash => install_bash(session_id),
            Self::Zsh => install_zsh(session_id),
            Self::None => {
                debug!("no shell integration available, spawning plainly");
                Ok(IntegrationFiles::none())
            }
        }
    }
}

/// Temp files backing one session's shell integration.
#[derive(Debug, Default)]
pub struct IntegrationFiles {
    /// Extra arguments for the shell command line.
    pub args: Vec<String>,
    /// Extra environment for the spawned shell.
    pub env: Vec<(String, String)>,
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl IntegrationFiles {
    pub fn none() -> Self {
        Self::default()
    }

    /// Remove the temp files; called when the PTY exits.
    pub fn cleanup(&self) {
        for file in &self.files {
            if let Err(e) = std::fs::remove_file(file) {
                debug!("failed to remove rc file {}: {}", file.display(), e);
            }
        }
        for dir in &self.dirs {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                debug!("failed to remove rc dir {}: {}", dir.display(), e);
            }
        }
    }
}

/// Hook body shared by both shells: emit the exit marker for the captured
/// command, then clear the capture variable.
const EMIT_EXIT_MARKER: &str = r#"__tabminal_emit() {
    if [ -n "$__TABMINAL_CMD" ]; then
        printf '\033]1337;ExitCode=%d;CommandB64=%s\007' "$1" \
            "$(printf '%s' "$__TABMINAL_CMD" | base64 | tr -d '\n')"
        __TABMINAL_CMD=''
    fi
}"#;

fn install_bash(session_id: &str) -> Result<IntegrationFiles> {
    let rc_path = std::env::temp_dir().join(format!("tabminal-{session_id}.bashrc"));

    let script = format!(
        r#"# tabminal shell integration (bash)
if [ -f "$HOME/.bashrc" ]; then
    . "$HOME/.bashrc"
fi

{EMIT_EXIT_MARKER}

__tabminal_preexec() {{
    [ -n "$COMP_LINE" ] && return
    [ "$BASH_COMMAND" = "$PROMPT_COMMAND" ] && return
    case "$BASH_COMMAND" in
        __tabminal_*) return ;;
    esac
    __TABMINAL_CMD=$BASH_COMMAND
}}
trap '__tabminal_preexec' DEBUG

__tabminal_precmd() {{
    __tabminal_emit "$?"
}}
PROMPT_COMMAND="__tabminal_precmd${{PROMPT_COMMAND:+;$PROMPT_COMMAND}}"

if [[ "$PS1" != *'1337;TabminalPrompt'* ]]; then
    PS1="$PS1\[\033]1337;TabminalPrompt\007\]"
fi
"#
    );

    std::fs::write(&rc_path, script)
        .map_err(|e| TabminalError::Integration(format!("write {}: {e}", rc_path.display())))?;
    debug!("installed bash integration at {}", rc_path.display());

    Ok(IntegrationFiles {
        args: vec!["--rcfile".to_string(), rc_path.to_string_lossy().into_owned()],
        env: vec![],
        files: vec![rc_path],
        dirs: vec![],
    })
}

fn install_zsh(session_id: &str) -> Result<IntegrationFiles> {
    let zdotdir = std::env::temp_dir().join(format!("tabminal-{session_id}-zdot"));
    std::fs::create_dir_all(&zdotdir)
        .map_err(|e| TabminalError::Integration(format!("mkdir {}: {e}", zdotdir.display())))?;

    // The user's ZDOTDIR (or home) is forwarded so their own .zshrc is
    // sourced first with its expected ZDOTDIR value.
    let user_zdotdir = std::env::var("ZDOTDIR").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    });

    let script = format!(
        r#"# tabminal shell integration (zsh)
if [ -f "$TABMINAL_USER_ZDOTDIR/.zshrc" ]; then
    ZDOTDIR="$TABMINAL_USER_ZDOTDIR" source "$TABMINAL_USER_ZDOTDIR/.zshrc"
fi

{EMIT_EXIT_MARKER}

__tabminal_preexec() {{
    __TABMINAL_CMD="$1"
}}
__tabminal_precmd() {{
    __tabminal_emit "$?"
}}
preexec_functions+=(__tabminal_preexec)
precmd_functions+=(__tabminal_precmd)

if [[ "$PROMPT" != *'1337;TabminalPrompt'* ]]; then
    PROMPT="${{PROMPT}}%{{$(printf '\033]1337;TabminalPrompt\007')%}}"
fi
"#
    );

    let rc_path = zdotdir.join(".zshrc");
    if let Err(e) = std::fs::write(&rc_path, script) {
        let _ = std::fs::remove_dir_all(&zdotdir);
        return Err(TabminalError::Integration(format!(
            "write {}: {e}",
            rc_path.display()
        )));
    }
    debug!("installed zsh integration at {}", rc_path.display());

    Ok(IntegrationFiles {
        args: vec![],
        env: vec![
            ("ZDOTDIR".to_string(), zdotdir.to_string_lossy().into_owned()),
            (
                "TABMINAL_USER_ZDOTDIR".to_string(),
                user_zdotdir.to_string_lossy().into_owned(),
            ),
        ],
        files: vec![],
        dirs: vec![zdotdir],
    })
}
