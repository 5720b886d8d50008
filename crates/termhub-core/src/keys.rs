//! Key token translation for session input
//!
//! Input tokens use tmux key names (`Enter`, `C-c`, `Up`, ...). Anything that
//! is not a key name is sent as literal text.

use crate::error::{Error, Result};

/// Translate input tokens into the bytes written to the pty.
///
/// With `literal` set, tokens are sent verbatim and no key names are expanded.
pub fn translate<S: AsRef<str>>(tokens: &[S], literal: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for token in tokens {
        let token = token.as_ref();
        if literal {
            out.extend_from_slice(token.as_bytes());
        } else {
            out.extend(key_to_bytes(token));
        }
    }
    out
}

/// Bytes for one token; unknown names pass through as text
pub fn key_to_bytes(key: &str) -> Vec<u8> {
    if let Some(seq) = function_key(key) {
        return seq;
    }
    if let Some(byte) = ctrl_char(key) {
        return vec![byte];
    }
    match key {
        "Enter" => vec![b'\r'],
        "Space" => vec![b' '],
        "BSpace" | "Backspace" => vec![0x7f],
        "Tab" => vec![b'\t'],
        "BTab" => b"\x1b[Z".to_vec(),
        "Escape" | "Esc" => vec![0x1b],
        "Up" => b"\x1b[A".to_vec(),
        "Down" => b"\x1b[B".to_vec(),
        "Right" => b"\x1b[C".to_vec(),
        "Left" => b"\x1b[D".to_vec(),
        "Home" => b"\x1b[H".to_vec(),
        "End" => b"\x1b[F".to_vec(),
        "PPage" | "PageUp" => b"\x1b[5~".to_vec(),
        "NPage" | "PageDown" => b"\x1b[6~".to_vec(),
        "IC" | "Insert" => b"\x1b[2~".to_vec(),
        "DC" | "Delete" => b"\x1b[3~".to_vec(),
        s if s.len() > 2 && s.starts_with("M-") => {
            // Meta prefixes ESC to whatever the rest translates to
            let mut bytes = vec![0x1b];
            bytes.extend(key_to_bytes(&s[2..]));
            bytes
        }
        other => other.as_bytes().to_vec(),
    }
}

/// `C-x` / `Ctrl-x` with a single character after the prefix
fn ctrl_char(key: &str) -> Option<u8> {
    let rest = key
        .strip_prefix("C-")
        .or_else(|| key.strip_prefix("Ctrl-"))?;
    match rest.as_bytes() {
        // C-a/C-A = 0x01, C-@ = 0x00, C-[ = 0x1b, C-\ = 0x1c
        [c] if c.is_ascii_alphabetic() || (b'@'..=b'_').contains(c) => Some(c & 0x1f),
        [b'?'] => Some(0x7f),
        [b' '] => Some(0x00),
        _ => None,
    }
}

fn function_key(key: &str) -> Option<Vec<u8>> {
    let n: u8 = key.strip_prefix('F')?.parse().ok()?;
    let seq: &[u8] = match n {
        1 => b"\x1bOP",
        2 => b"\x1bOQ",
        3 => b"\x1bOR",
        4 => b"\x1bOS",
        5 => b"\x1b[15~",
        6 => b"\x1b[17~",
        7 => b"\x1b[18~",
        8 => b"\x1b[19~",
        9 => b"\x1b[20~",
        10 => b"\x1b[21~",
        11 => b"\x1b[23~",
        12 => b"\x1b[24~",
        _ => return None,
    };
    Some(seq.to_vec())
}

/// Parse a detach chord such as `C-\` or `C-q` into the byte the terminal
/// sends for it
pub fn parse_detach_key(key: &str) -> Result<u8> {
    ctrl_char(key.trim()).ok_or_else(|| {
        Error::Config(format!(
            "detach key must be a control chord like C-\\ or C-q, got '{}'",
            key
        ))
    })
}
