//! Escape-sequence stripping for raw pty output

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

/// Everything a terminal would interpret rather than display.
///
/// Order matters: string sequences (OSC, DCS/SOS/PM/APC) must win over the
/// generic two-byte ESC form, and CRLF over the bare C0 class.
static CONTROL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s-u)\x1b\][^\x07\x1b]*(?:\x07|\x1b\\|\z)|\x1b[PX^_].*?(?:\x1b\\|\z)|\x1b\[[0-?]*[ -/]*[@-~]|\x1b[ -/]*[0-~]|\x1b|\r\n|[\x00-\x08\x0b-\x1f\x7f]",
    )
    .unwrap()
});

/// Remove escape sequences and control bytes from `input`.
///
/// Newlines and tabs survive, `\r\n` collapses to `\n`, and printable bytes
/// (including non-ASCII UTF-8) are passed through untouched.
pub fn strip(input: &[u8]) -> Vec<u8> {
    CONTROL_RE
        .replace_all(input, |caps: &Captures| {
            if &caps[0] == b"\r\n" {
                b"\n".to_vec()
            } else {
                Vec::new()
            }
        })
        .into_owned()
}

/// Longest escape sequence held back waiting for its end; anything longer
/// is released as-is
const MAX_PENDING: usize = 4096;

#[derive(Clone, Copy)]
enum Scan {
    Ground,
    Escape,
    Intermediate,
    Csi,
    Osc,
    OscEscape,
    Str,
    StrEscape,
}

/// Length of the prefix of `bytes` that does not end inside an escape
/// sequence or a multi-byte UTF-8 character.
///
/// Output is read in arbitrary slices; cutting at this boundary keeps a
/// sequence whose tail has not arrived yet out of the current slice so that
/// the next one carries it whole.
pub fn complete_len(bytes: &[u8]) -> usize {
    let mut scan = Scan::Ground;
    let mut open = 0;
    for (i, &b) in bytes.iter().enumerate() {
        scan = match (scan, b) {
            (Scan::OscEscape, b'\\') | (Scan::StrEscape, b'\\') => Scan::Ground,
            (Scan::StrEscape, 0x1b) => Scan::StrEscape,
            (Scan::StrEscape, _) => Scan::Str,
            (Scan::Str, 0x1b) => Scan::StrEscape,
            (Scan::Str, _) => Scan::Str,
            (Scan::Osc, 0x07) => Scan::Ground,
            (Scan::Osc, 0x1b) => Scan::OscEscape,
            (Scan::Osc, _) => Scan::Osc,
            (_, 0x1b) => {
                open = i;
                Scan::Escape
            }
            // An OSC cut short by a new sequence
            (Scan::OscEscape, _) => {
                open = i - 1;
                after_escape(b)
            }
            (Scan::Escape, _) => after_escape(b),
            (Scan::Intermediate, 0x20..=0x2f) => Scan::Intermediate,
            (Scan::Csi, 0x20..=0x3f) => Scan::Csi,
            _ => Scan::Ground,
        };
    }

    match scan {
        Scan::Ground => utf8_complete_len(bytes),
        _ if bytes.len() - open > MAX_PENDING => bytes.len(),
        _ => open,
    }
}

fn after_escape(b: u8) -> Scan {
    match b {
        b'[' => Scan::Csi,
        b']' => Scan::Osc,
        b'P' | b'X' | b'^' | b'_' => Scan::Str,
        0x20..=0x2f => Scan::Intermediate,
        _ => Scan::Ground,
    }
}

fn utf8_complete_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A character is at most 4 bytes, so its lead is within the last 4
    for back in 1..=len.min(4) {
        let b = bytes[len - back];
        if b & 0xc0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}

/// Reassembles a chunked byte stream on escape-sequence boundaries
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Vec<u8>,
}

impl Reassembler {
    /// Start with bytes left over from an earlier read
    pub fn new(pending: Vec<u8>) -> Self {
        Self { pending }
    }

    /// Append `chunk` and return everything up to the last complete sequence
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);
        let keep = complete_len(&self.pending);
        let tail = self.pending.split_off(keep);
        std::mem::replace(&mut self.pending, tail)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whatever is still held back, once no more input will come
    pub fn finish(self) -> Vec<u8> {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strip_text(input: &str) -> String {
        String::from_utf8_lossy(&strip(input.as_bytes())).into_owned()
    }

    #[test]
    fn test_printable_text_is_identity() {
        let text = "plain text, ümlauts, 漢字\n\tindented\n";
        assert_eq!(strip_text(text), text);
    }

    #[test]
    fn test_only_escapes_yield_empty() {
        assert_eq!(strip(b"\x1b[1;31m\x1b[0m\x1b[2J\x1b[H\x1b]0;title\x07\x1b(B\x1b=\x1b[?25l"), b"");
    }

    #[test]
    fn test_sgr_removed() {
        assert_eq!(strip_text("\x1b[1;32mok\x1b[0m done"), "ok done");
        assert_eq!(strip_text("\x1b[38;2;10;20;30mrgb\x1b[m"), "rgb");
    }

    #[test]
    fn test_osc_variants() {
        assert_eq!(strip_text("a\x1b]0;title\x07b"), "ab");
        assert_eq!(strip_text("a\x1b]8;;http://example.com\x1b\\link\x1b]8;;\x1b\\b"), "alinkb");
        // Unterminated at end of input
        assert_eq!(strip_text("a\x1b]2;partial"), "a");
    }

    #[test]
    fn test_device_control_strings_removed() {
        assert_eq!(strip_text("x\x1bPq#0;2;0;0;0\x1b\\y"), "xy");
        assert_eq!(strip_text("x\x1b_Gf=100;payload\x1b\\y"), "xy");
    }

    #[test]
    fn test_line_endings_and_controls() {
        assert_eq!(strip_text("one\r\ntwo\r\n"), "one\ntwo\n");
        assert_eq!(strip_text("bell\x07 back\x08space\r"), "bell backspace");
        assert_eq!(strip_text("del\x7f"), "del");
    }

    #[test]
    fn test_private_and_intermediate_csi() {
        assert_eq!(strip_text("\x1b[?2004hprompt\x1b[>4;1m$ \x1b[2 q"), "prompt$ ");
    }

    #[test]
    fn test_invalid_utf8_passes_through() {
        assert_eq!(strip(b"\xff\x1b[0m\xfe"), b"\xff\xfe");
    }

    #[test]
    fn test_complete_len_holds_back_open_sequences() {
        assert_eq!(complete_len(b"hello"), 5);
        assert_eq!(complete_len(b"hello\x1b"), 5);
        assert_eq!(complete_len(b"hello\x1b[3"), 5);
        assert_eq!(complete_len(b"hello\x1b[31m"), 10);
        assert_eq!(complete_len(b"a\x1b]0;tit"), 1);
        assert_eq!(complete_len(b"a\x1b]0;title\x1b"), 1);
        assert_eq!(complete_len(b"a\x1b]0;title\x1b\\"), 12);
        assert_eq!(complete_len(b"a\x1b]0;title\x07"), 11);
        assert_eq!(complete_len(b"x\x1bPq#0\x1b\\y\x1b("), 9);
        assert_eq!(complete_len(b"a\x1b]0;t\x1b[3"), 6);
        assert_eq!(complete_len(b"\x1b(B"), 3);
    }

    #[test]
    fn test_complete_len_holds_back_split_characters() {
        let text = "ab漢".as_bytes();
        assert_eq!(complete_len(&text[..3]), 2);
        assert_eq!(complete_len(&text[..4]), 2);
        assert_eq!(complete_len(text), 5);
        assert_eq!(complete_len("é".as_bytes()), 2);
        assert_eq!(complete_len(b"\xff"), 1);
    }

    #[test]
    fn test_complete_len_releases_oversized_sequences() {
        let mut long = b"\x1b]0;".to_vec();
        long.extend(std::iter::repeat(b'x').take(MAX_PENDING + 1));
        assert_eq!(complete_len(&long), long.len());
    }

    #[test]
    fn test_reassembler_strips_split_sequences() {
        let mut stream = Reassembler::default();
        assert_eq!(strip(&stream.push(b"hello\x1b[3")), b"hello");
        assert_eq!(strip(&stream.push(b"1mred")), b"red");
        assert_eq!(stream.push(b"\x1b]0;t"), b"");
        assert_eq!(stream.push(b"\x07!"), b"\x1b]0;t\x07!");
        assert_eq!(stream.push(b"\x1b"), b"");
        assert_eq!(stream.finish(), b"\x1b");
    }
}
