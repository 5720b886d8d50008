//! Virtual terminal emulator
//!
//! Interprets a session's pty output as a terminal would, keeping a character
//! grid plus bounded scrollback so the daemon can answer "what is on screen"
//! without a real terminal attached. Parsing and the grid are vt100's; this
//! module adds plain-text rendering over scrollback and the replies a real
//! terminal owes the application for device queries.

use vt100::{Callbacks, Parser, Screen};

/// Device queries vt100 leaves to the embedder
#[derive(Debug, Default)]
struct Replies {
    pending: Vec<u8>,
}

impl Callbacks for Replies {
    fn unhandled_csi(
        &mut self,
        screen: &mut Screen,
        i1: Option<u8>,
        _i2: Option<u8>,
        params: &[&[u16]],
        c: char,
    ) {
        if i1.is_some() {
            return;
        }
        let first = params
            .first()
            .and_then(|param| param.first())
            .copied()
            .unwrap_or(0);
        match (c, first) {
            // DSR: operating status
            ('n', 5) => self.pending.extend_from_slice(b"\x1b[0n"),
            // DSR: cursor position, 1-based
            ('n', 6) => {
                let (row, col) = screen.cursor_position();
                self.pending
                    .extend_from_slice(format!("\x1b[{};{}R", row + 1, col + 1).as_bytes());
            }
            // Primary DA: VT100 with advanced video
            ('c', 0) => self.pending.extend_from_slice(b"\x1b[?1;2c"),
            _ => {}
        }
    }
}

/// A terminal: vt100 parser and screen plus pending device replies
pub struct Emulator {
    parser: Parser<Replies>,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("size", &self.size())
            .field("cursor", &self.cursor_position())
            .finish()
    }
}

impl Emulator {
    /// Create an emulator; zero dimensions are raised to 1
    pub fn new(cols: u16, rows: u16, scrollback_lines: usize) -> Self {
        Self {
            parser: Parser::new_with_callbacks(
                rows.max(1),
                cols.max(1),
                scrollback_lines,
                Replies::default(),
            ),
        }
    }

    /// Feed pty output. Never fails; unknown sequences are ignored
    pub fn consume(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    /// Last `max_lines` lines (scrollback + screen) as plain text, or the
    /// whole current screen when `None`. Trailing blanks are trimmed per line
    /// and trailing empty lines are dropped.
    pub fn render(&mut self, max_lines: Option<usize>) -> String {
        let (_, cols) = self.parser.screen().size();
        let mut lines = Vec::new();

        if let Some(max) = max_lines {
            // With the view scrolled back by `offset`, its top row is the
            // `offset`-th most recent scrollback line
            let wanted = max.min(self.history_len());
            for offset in (1..=wanted).rev() {
                self.parser.screen_mut().set_scrollback(offset);
                if let Some(line) = self.parser.screen().rows(0, cols).next() {
                    lines.push(line);
                }
            }
            self.parser.screen_mut().set_scrollback(0);
        }
        lines.extend(self.parser.screen().rows(0, cols));

        let mut lines: Vec<&str> = lines.iter().map(|line| line.trim_end()).collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        if let Some(max) = max_lines {
            let skip = lines.len().saturating_sub(max);
            lines.drain(..skip);
        }
        lines.join("\n")
    }

    /// Resize the grid; zero dimensions are raised to 1
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser
            .screen_mut()
            .set_size(rows.max(1), cols.max(1));
    }

    /// Size as (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    /// Cursor as (row, col), 0-indexed
    pub fn cursor_position(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    /// Replies owed to the application for device queries (DSR, DA)
    pub fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.parser.callbacks_mut().pending)
    }

    /// Bytes that redraw the current screen on a freshly attached terminal
    pub fn repaint(&self) -> Vec<u8> {
        let screen = self.parser.screen();
        let mut out = Vec::new();
        if screen.alternate_screen() {
            out.extend_from_slice(b"\x1b[?1049h");
        }
        out.extend_from_slice(b"\x1b[H\x1b[2J");
        out.extend(screen.contents_formatted());
        out
    }

    /// Lines currently held in scrollback
    fn history_len(&mut self) -> usize {
        let screen = self.parser.screen_mut();
        // The offset is clamped to what the scrollback holds
        screen.set_scrollback(usize::MAX);
        let len = screen.scrollback();
        screen.set_scrollback(0);
        len
    }
}
