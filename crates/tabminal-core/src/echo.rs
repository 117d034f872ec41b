//! Echo isolation and normalization
//!
//! When an exit marker closes a command, the capture buffer holds the
//! shell's echo of the command line followed by the command's real output,
//! usually interleaved with prompt styling, backspace corrections, and line
//! wraps. This module finds where the echo starts, normalizes it into
//! canonical input line(s), and sanitizes the remainder for the execution
//! record's output field. The broadcast stream is never touched by any of
//! this.

/// Tail window for the unanchored last-occurrence fallback.
const RECENT_TAIL_LIMIT: usize = 4096;

/// Split a capture buffer into (input, output) for the given command.
///
/// `input` is the normalized echo (first line plus any continuation-prompt
/// lines); `output` is everything after it, sanitized. With no usable
/// command the whole buffer is treated as output.
pub fn split_echo(buffer: &str, command: Option<&str>) -> (String, String) {
    let cmd = command.map(str::trim).unwrap_or("");
    if cmd.is_empty() {
        return (String::new(), sanitize_record_output(buffer));
    }

    if let Some(idx) = find_anchored_echo(buffer, cmd).or_else(|| find_recent_echo(buffer, cmd)) {
        return split_at_echo(&buffer[idx..]);
    }

    if let Some((line, rest_idx)) = reconstruct_echo(buffer, cmd) {
        let (continuation, out) = take_continuations(&buffer[rest_idx..]);
        return (format!("{line}{continuation}"), sanitize_record_output(out));
    }

    // No echo found anywhere. The prompt marker already discarded everything
    // before the echo, so the buffer head is the best remaining estimate.
    split_at_echo(buffer)
}

/// Last occurrence of `cmd` followed by CR/LF and preceded by a plausible
/// prompt terminator.
fn find_anchored_echo(buffer: &str, cmd: &str) -> Option<usize> {
    let mut found = None;
    for (idx, _) in buffer.match_indices(cmd) {
        let after = &buffer[idx + cmd.len()..];
        if !(after.starts_with('\r') || after.starts_with('\n')) {
            continue;
        }
        let plausible = match buffer[..idx].chars().next_back() {
            None => true,
            Some(prev) => {
                prev.is_whitespace() || matches!(prev, '$' | '>' | '❯' | ':' | '\u{1b}')
            }
        };
        if plausible {
            found = Some(idx);
        }
    }
    found
}

/// Last occurrence of `cmd`, accepted only when the remaining tail is small
/// enough that the match is plausibly the echo and not deep in output.
fn find_recent_echo(buffer: &str, cmd: &str) -> Option<usize> {
    let idx = buffer.rfind(cmd)?;
    (buffer.len() - idx <= RECENT_TAIL_LIMIT).then_some(idx)
}

/// Simulated line reconstruction: walk the buffer maintaining the logical
/// current line (ANSI skipped, backspace pops, CR/LF flushes) and remember
/// the last flushed line that ends with `cmd`. Returns the reconstructed
/// line with its terminator and the byte index just past it.
fn reconstruct_echo(buffer: &str, cmd: &str) -> Option<(String, usize)> {
    let bytes = buffer.as_bytes();
    let mut line = String::new();
    let mut candidate = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == 0x1b {
            i = skip_escape(bytes, i);
            continue;
        }
        match b {
            0x08 | 0x7f => {
                line.pop();
                i += 1;
            }
            b'\r' | b'\n' => {
                let (terminator, end) = if b == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
                    ("\r\n", i + 2)
                } else {
                    ("\n", i + 1)
                };
                if line.ends_with(cmd) {
                    candidate = Some((format!("{line}{terminator}"), end));
                }
                line.clear();
                i = end;
            }
            _ => {
                let ch = buffer[i..].chars().next().expect("in-bounds char");
                line.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    candidate
}

/// Split an echo-first region into normalized input and sanitized output.
fn split_at_echo(region: &str) -> (String, String) {
    let (first, rest) = split_first_line(region);
    let mut input = normalize_echo_line(first);
    let (continuation, out) = take_continuations(rest);
    input.push_str(&continuation);
    (input, sanitize_record_output(out))
}

fn split_first_line(region: &str) -> (&str, &str) {
    match region.find('\n') {
        Some(idx) => region.split_at(idx + 1),
        None => (region, ""),
    }
}

/// Consume leading lines that belong to the echo: empty lines and lines
/// starting with a shell continuation prompt. Returns the normalized
/// continuation text and the raw remainder where output begins.
fn take_continuations(rest: &str) -> (String, &str) {
    let mut input = String::new();
    let mut offset = 0;

    for raw_line in rest.split_inclusive('\n') {
        let content = strip_ansi(raw_line);
        let content = content.trim_end_matches(['\r', '\n']);
        if !is_continuation_prompt(content) {
            break;
        }
        input.push_str(&normalize_echo_line(raw_line));
        offset += raw_line.len();
    }

    (input, &rest[offset..])
}

fn is_continuation_prompt(content: &str) -> bool {
    if content.is_empty() {
        return true;
    }
    for prefix in ["quote>", "heredoc>", "ps2>"] {
        if content.starts_with(prefix) {
            return true;
        }
    }
    matches!(content.chars().next(), Some('>' | '+' | '?'))
}

/// Canonicalize one echoed line: collapse backspaces, drop ANSI sequences,
/// strip stray CRs. A CR immediately before the terminating LF is kept, and
/// processing stops at the first LF. Applying this twice equals applying it
/// once.
pub fn normalize_echo_line(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut line = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == 0x1b {
            i = skip_escape(bytes, i);
            continue;
        }
        match b {
            0x08 | 0x7f => {
                line.pop();
                i += 1;
            }
            b'\r' => {
                if bytes.get(i + 1) == Some(&b'\n') {
                    line.push_str("\r\n");
                    break;
                }
                i += 1;
            }
            b'\n' => {
                line.push('\n');
                break;
            }
            _ => {
                let ch = raw[i..].chars().next().expect("in-bounds char");
                line.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    line
}

/// Sanitize command output for an execution record: drop escape sequences
/// (OSC, DCS, CSI, SOS/PM/APC) and C0 controls except tab and LF, normalize
/// CRLF to LF, strip per-line trailing whitespace. Broadcast bytes never go
/// through here.
pub fn sanitize_record_output(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut flat = String::with_capacity(s.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == 0x1b {
            i = skip_escape(bytes, i);
            continue;
        }
        let ch = s[i..].chars().next().expect("in-bounds char");
        i += ch.len_utf8();
        match ch {
            '\t' | '\n' => flat.push(ch),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {}
            c => flat.push(c),
        }
    }

    let mut cleaned = String::with_capacity(flat.len());
    for segment in flat.split_inclusive('\n') {
        match segment.strip_suffix('\n') {
            Some(content) => {
                cleaned.push_str(content.trim_end_matches([' ', '\t']));
                cleaned.push('\n');
            }
            None => cleaned.push_str(segment.trim_end_matches([' ', '\t'])),
        }
    }
    cleaned
}

/// Remove escape sequences, leaving control characters alone.
pub fn strip_ansi(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == 0x1b {
            i = skip_escape(bytes, i);
            continue;
        }
        let ch = s[i..].chars().next().expect("in-bounds char");
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

/// Skip one escape sequence starting at `start` (which holds ESC); returns
/// the index of the first byte after it.
fn skip_escape(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    match bytes.get(i) {
        // CSI: parameters and intermediates, then one final byte.
        Some(b'[') => {
            i += 1;
            while let Some(&b) = bytes.get(i) {
                if (0x20..=0x3f).contains(&b) {
                    i += 1;
                } else {
                    break;
                }
            }
            if let Some(&b) = bytes.get(i) {
                if (0x40..=0x7e).contains(&b) {
                    i += 1;
                }
            }
            i
        }
        // OSC / DCS / SOS / PM / APC: until BEL or ST.
        Some(b']') | Some(b'P') | Some(b'X') | Some(b'^') | Some(b'_') => {
            i += 1;
            while let Some(&b) = bytes.get(i) {
                if b == 0x07 {
                    return i + 1;
                }
                if b == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                    return i + 2;
                }
                i += 1;
            }
            i
        }
        Some(_) => i + 1,
        None => i,
    }
}
