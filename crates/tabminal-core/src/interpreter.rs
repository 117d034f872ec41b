//! Stream interpreter
//!
//! Stateful transducer over the raw PTY byte stream. Produces the cleaned
//! stream for history and broadcast (tabminal-private markers removed),
//! metadata updates from standard OSC bodies, and execution records
//! completed by exit markers.
//!
//! Markers are only ever recognized here, on the PTY stream; decoded
//! command text goes into records and is never fed back, so a command that
//! itself contains marker-looking bytes cannot re-trigger recognition.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tabminal_types::ExecutionRecord;
use tracing::debug;

use crate::echo;
use crate::scanner::{OscScanner, Token};

const PRIVATE_PREFIX: &str = "1337;";
const PROMPT_BODY: &str = "1337;TabminalPrompt";
const EXIT_PREFIX: &str = "1337;ExitCode=";

/// What one chunk of PTY bytes turned into.
#[derive(Debug, Default)]
pub struct Interpreted {
    /// Broadcast/history bytes: the input minus tabminal-private markers.
    pub cleaned: Vec<u8>,
    /// Title change observed in this chunk, if any.
    pub title: Option<String>,
    /// Working-directory change observed in this chunk, if any.
    pub cwd: Option<String>,
    /// Execution records completed by exit markers in this chunk.
    pub records: Vec<ExecutionRecord>,
}

pub struct StreamInterpreter {
    scanner: OscScanner,
    capture: Vec<u8>,
    capture_started_at: Option<DateTime<Utc>>,
    title: Option<String>,
    cwd: Option<String>,
}

impl StreamInterpreter {
    pub fn new() -> Self {
        Self {
            scanner: OscScanner::new(),
            capture: Vec::new(),
            capture_started_at: None,
            title: None,
            cwd: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Interpreted {
        let mut out = Interpreted::default();
        for token in self.scanner.feed(chunk) {
            match token {
                Token::Text(bytes) => {
                    if self.capture_started_at.is_none() && !bytes.is_empty() {
                        self.capture_started_at = Some(Utc::now());
                    }
                    self.capture.extend_from_slice(&bytes);
                    out.cleaned.extend(bytes);
                }
                Token::Osc { body, raw } => self.on_osc(&body, raw, &mut out),
            }
        }
        out
    }

    fn on_osc(&mut self, body: &str, raw: Vec<u8>, out: &mut Interpreted) {
        if body == PROMPT_BODY {
            // Prompt decoration is not part of any command.
            self.capture.clear();
            self.capture_started_at = None;
            return;
        }

        if body.starts_with(PRIVATE_PREFIX) {
            if let Some((exit_code, b64)) = parse_exit_marker(body) {
                out.records.push(self.complete_execution(exit_code, b64));
                return;
            }
            // Some other 1337 body; not ours, forward untouched.
            out.cleaned.extend_from_slice(&raw);
            return;
        }

        if let Some(title) = body.strip_prefix("0;").or_else(|| body.strip_prefix("2;")) {
            if self.title.as_deref() != Some(title) {
                self.title = Some(title.to_string());
                out.title = Some(title.to_string());
            }
        } else if let Some(url) = body.strip_prefix("7;") {
            if let Some(path) = parse_file_url_path(url) {
                if self.cwd.as_deref() != Some(path.as_str()) {
                    self.cwd = Some(path.clone());
                    out.cwd = Some(path);
                }
            }
        }
        out.cleaned.extend_from_slice(&raw);
    }

    fn complete_execution(&mut self, exit_code: i32, b64: &str) -> ExecutionRecord {
        let completed_at = Utc::now();
        let started_at = self.capture_started_at.take().unwrap_or(completed_at);

        let command = BASE64
            .decode(b64)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string());

        let buffer = String::from_utf8_lossy(&self.capture).into_owned();
        self.capture.clear();
        let (input, output) = echo::split_echo(&buffer, command.as_deref());

        debug!(command = ?command, exit_code, "command completed");

        ExecutionRecord {
            command,
            exit_code: Some(exit_code),
            input,
            output,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
        }
    }
}

impl Default for StreamInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `1337;ExitCode=<digits>;CommandB64=<base64>`. Anything that does
/// not match exactly is not a private marker.
fn parse_exit_marker(body: &str) -> Option<(i32, &str)> {
    let rest = body.strip_prefix(EXIT_PREFIX)?;
    let (digits, b64) = rest.split_once(";CommandB64=")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, b64))
}

/// Extract the pathname from a `file://host/path` URL, percent-decoded.
fn parse_file_url_path(url: &str) -> Option<String> {
    let rest = url.strip_prefix("file://")?;
    let path_start = rest.find('/')?;
    Some(percent_decode(&rest[path_start..]))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &[u8] = b"\x1b]1337;TabminalPrompt\x07";

    fn exit_marker(code: i32, command: &str) -> Vec<u8> {
        format!(
            "\x1b]1337;ExitCode={};CommandB64={}\x07",
            code,
            BASE64.encode(command)
        )
        .into_bytes()
    }

    #[test]
    fn basic_capture() {
        let mut interp = StreamInterpreter::new();
        interp.feed(b"prompt$ ");
        interp.feed(PROMPT);
        interp.feed(b"ls\nfile.txt\n");
        let out = interp.feed(&exit_marker(0, "ls"));

        assert_eq!(out.records.len(), 1);
        let record = &out.records[0];
        assert_eq!(record.command.as_deref(), Some("ls"));
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.input, "ls\n");
        assert_eq!(record.output, "file.txt\n");
        assert!(record.duration_ms >= 0);
    }

    #[test]
    fn consecutive_commands() {
        let mut interp = StreamInterpreter::new();
        interp.feed(b"prompt$ ");
        interp.feed(PROMPT);
        interp.feed(b"ls\nfile.txt\n");
        let first = interp.feed(&exit_marker(0, "ls"));
        assert_eq!(first.records.len(), 1);

        interp.feed(b"prompt$ ");
        interp.feed(PROMPT);
        interp.feed(b"pwd\n/bar\n");
        let second = interp.feed(&exit_marker(0, "pwd"));

        assert_eq!(second.records.len(), 1);
        let record = &second.records[0];
        assert_eq!(record.command.as_deref(), Some("pwd"));
        assert_eq!(record.output, "/bar\n");
    }

    #[test]
    fn multi_line_prompt_decoration_is_dropped() {
        let mut interp = StreamInterpreter::new();
        interp.feed("\r\n⎧ banner\r\n⎨ /vols\r\n⎩ \x1b[33m$ ❯\x1b[0m ".as_bytes());
        interp.feed(PROMPT);
        interp.feed(b"ls\nclient\n");
        let out = interp.feed(&exit_marker(0, "ls"));

        let record = &out.records[0];
        assert_eq!(record.command.as_deref(), Some("ls"));
        assert_eq!(record.output, "client\n");
    }

    #[test]
    fn continuation_prompts_are_part_of_input() {
        let mut interp = StreamInterpreter::new();
        interp.feed(PROMPT);
        interp.feed(b"echo first \\\r\n> second \\\r\n> third\r\nfirst second third\n");
        let out = interp.feed(&exit_marker(0, "echo first second third"));

        let record = &out.records[0];
        assert!(record.input.contains("> second"));
        assert!(record.input.contains("> third"));
        assert_eq!(record.output, "first second third\n");
    }

    #[test]
    fn backspaces_are_collapsed_in_echo() {
        let mut interp = StreamInterpreter::new();
        interp.feed(PROMPT);
        interp.feed(b"ls -XXXX\x08\x08\x08\x08\x1b[KBB\r\nitem\n");
        let out = interp.feed(&exit_marker(0, "ls -BB"));

        let record = &out.records[0];
        assert_eq!(record.command.as_deref(), Some("ls -BB"));
        assert_eq!(record.input, "ls -BB\r\n");
        assert_eq!(record.output, "item\n");
    }

    #[test]
    fn markers_are_stripped_from_the_cleaned_stream() {
        let mut interp = StreamInterpreter::new();
        let mut chunk = b"before".to_vec();
        chunk.extend_from_slice(PROMPT);
        chunk.extend_from_slice(b"after");
        let out = interp.feed(&chunk);
        assert_eq!(out.cleaned, b"beforeafter");
    }

    #[test]
    fn foreign_1337_bodies_pass_through() {
        let mut interp = StreamInterpreter::new();
        let out = interp.feed(b"\x1b]1337;SetUserVar=foo\x07");
        assert_eq!(out.cleaned, b"\x1b]1337;SetUserVar=foo\x07");
        assert!(out.records.is_empty());
    }

    #[test]
    fn malformed_exit_marker_passes_through() {
        let mut interp = StreamInterpreter::new();
        let out = interp.feed(b"\x1b]1337;ExitCode=abc\x07");
        assert_eq!(out.cleaned, b"\x1b]1337;ExitCode=abc\x07");
        assert!(out.records.is_empty());
    }

    #[test]
    fn undecodable_command_still_emits_a_record() {
        let mut interp = StreamInterpreter::new();
        interp.feed(PROMPT);
        interp.feed(b"output line\n");
        let out = interp.feed(b"\x1b]1337;ExitCode=1;CommandB64=!!!not-base64!!!\x07");

        assert_eq!(out.records.len(), 1);
        let record = &out.records[0];
        assert_eq!(record.command, None);
        assert_eq!(record.exit_code, Some(1));
        assert_eq!(record.output, "output line\n");
    }

    #[test]
    fn marker_split_across_chunks_is_recognized_once() {
        let mut interp = StreamInterpreter::new();
        interp.feed(PROMPT);
        interp.feed(b"ls\nfile\n");
        let marker = exit_marker(0, "ls");
        let (a, b) = marker.split_at(10);
        let first = interp.feed(a);
        assert!(first.records.is_empty());
        let second = interp.feed(b);
        assert_eq!(second.records.len(), 1);
        let third = interp.feed(b"");
        assert!(third.records.is_empty());
    }

    #[test]
    fn title_and_cwd_updates_pass_through_and_change_once() {
        let mut interp = StreamInterpreter::new();
        let out = interp.feed(b"\x1b]2;vim\x07");
        assert_eq!(out.title.as_deref(), Some("vim"));
        assert_eq!(out.cleaned, b"\x1b]2;vim\x07");

        // Same title again: no change reported.
        let out = interp.feed(b"\x1b]2;vim\x07");
        assert_eq!(out.title, None);

        let out = interp.feed(b"\x1b]7;file://host/tmp/work%20dir\x07");
        assert_eq!(out.cwd.as_deref(), Some("/tmp/work dir"));

        let out = interp.feed(b"\x1b]7;file://host/tmp/work%20dir\x07");
        assert_eq!(out.cwd, None);
    }

    #[test]
    fn command_containing_marker_bytes_does_not_retrigger() {
        let mut interp = StreamInterpreter::new();
        interp.feed(PROMPT);
        interp.feed(b"echo hi\nhi\n");
        let sneaky = "echo \x1b]1337;TabminalPrompt\x07";
        let out = interp.feed(&exit_marker(0, sneaky));

        assert_eq!(out.records.len(), 1);
        assert!(out.records[0]
            .command
            .as_deref()
            .unwrap()
            .contains("TabminalPrompt"));
        // The decoded text never re-enters the scanner: no capture reset
        // happened beyond the normal end-of-record one.
        let after = interp.feed(b"next\n");
        assert_eq!(after.cleaned, b"next\n");
    }

    #[test]
    fn command_b64_round_trips() {
        let command = "grep -r 'needle' .";
        let encoded = BASE64.encode(command);
        let decoded = BASE64.decode(&encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), command);
    }
}
