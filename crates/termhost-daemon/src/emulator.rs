//! Headless terminal emulator (spec.md §4.C).
//!
//! Feeds PTY output bytes through a `vte::Parser`. Rather than a full VT
//! backend, the `Perform` impl here tracks exactly what spec.md §4.C and §9
//! ("from OS-specific escape parsing to bounded scanning") call for: the
//! visible character grid (for snapshotting), DEC private modes, and the
//! OSC-7 working directory. Everything else vte reports (SGR colors, cursor
//! queries) is observed only far enough to keep grid/cursor state coherent;
//! `vte::Parser` already owns partial-sequence buffering across chunk
//! boundaries, so there is no separate bounded buffer to manage here.

use std::collections::HashMap;

use termhost_protocol::{EmulatorSnapshot, DEFAULT_ON_MODES, TRACKED_DEC_MODES};
use vte::{Params, Parser, Perform};

/// One emulator instance per session (spec.md §3 "Emulator state").
pub struct Emulator {
    parser: Parser,
    perform: GridPerform,
}

impl Emulator {
    pub fn new(cols: u16, rows: u16, scrollback_capacity: usize) -> Self {
        Self {
            parser: Parser::new(),
            perform: GridPerform::new(cols, rows, scrollback_capacity),
        }
    }

    /// Feeds PTY output bytes. Bytes longer than one scheduling slice are
    /// meant to be split by the caller's pump (spec.md §4.D) — this method
    /// itself does not apply a time budget.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.perform, bytes);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.perform.resize(cols, rows);
    }

    pub fn cwd(&self) -> Option<&str> {
        self.perform.cwd.as_deref()
    }

    pub fn mode(&self, mode: u16) -> bool {
        self.perform.mode_state(mode)
    }

    /// Clears the scrollback but keeps the visible grid intact — spec.md §9
    /// open question: `clearScrollback` clears the active buffer only.
    pub fn clear_scrollback(&mut self) {
        self.perform.scrollback.clear();
    }

    pub fn scrollback_lines(&self) -> usize {
        self.perform.scrollback.len()
    }

    /// Releases scrollback memory promptly (spec.md §4.C "Disposal").
    pub fn dispose(&mut self) {
        self.perform.scrollback.clear();
        self.perform.grid.clear();
    }

    /// Drains bytes synthesized in response to output queries (CPR, DA) a
    /// real terminal would have answered (spec.md §4.C) — the caller is
    /// expected to write these back to the PTY's stdin when no client is
    /// attached to answer them instead.
    pub fn drain_pending_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.perform.pending_replies)
    }

    /// Produces `snapshotAnsi` + `rehydrateSequences` + metadata (spec.md §4.C).
    pub fn snapshot(&self) -> EmulatorSnapshot {
        EmulatorSnapshot {
            snapshot_ansi: self.perform.render_ansi(),
            rehydrate_sequences: self.perform.rehydrate_sequences(),
            cwd: self.perform.cwd.clone(),
            cols: self.perform.cols,
            rows: self.perform.rows,
            scrollback_lines: self.perform.scrollback.len(),
            modes: self.perform.modes.clone(),
        }
    }
}

struct GridPerform {
    cols: u16,
    rows: u16,
    grid: Vec<Vec<char>>,
    alt_grid: Option<Vec<Vec<char>>>,
    cursor_row: usize,
    cursor_col: usize,
    scrollback: std::collections::VecDeque<Vec<char>>,
    scrollback_capacity: usize,
    modes: HashMap<u16, bool>,
    cwd: Option<String>,
    pending_replies: Vec<u8>,
}

impl GridPerform {
    fn new(cols: u16, rows: u16, scrollback_capacity: usize) -> Self {
        let mut modes = HashMap::new();
        for &m in TRACKED_DEC_MODES {
            modes.insert(m, DEFAULT_ON_MODES.contains(&m));
        }
        Self {
            cols,
            rows,
            grid: blank_grid(cols, rows),
            alt_grid: None,
            cursor_row: 0,
            cursor_col: 0,
            scrollback: std::collections::VecDeque::new(),
            scrollback_capacity,
            modes,
            cwd: None,
            pending_replies: Vec::new(),
        }
    }

    /// Queues bytes for `session.rs` to hand back to the PTY's stdin when
    /// nobody is attached to answer an output query itself (spec.md §4.C).
    fn queue_reply(&mut self, reply: &str) {
        self.pending_replies.extend_from_slice(reply.as_bytes());
    }

    fn mode_state(&self, mode: u16) -> bool {
        self.modes.get(&mode).copied().unwrap_or(false)
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        self.grid.resize_with(rows as usize, || vec![' '; cols as usize]);
        for row in &mut self.grid {
            row.resize(cols as usize, ' ');
        }
        self.cursor_row = self.cursor_row.min(rows.saturating_sub(1) as usize);
        self.cursor_col = self.cursor_col.min(cols.saturating_sub(1) as usize);
    }

    fn put_char(&mut self, c: char) {
        if self.cursor_col >= self.cols as usize {
            self.newline();
        }
        if let Some(row) = self.grid.get_mut(self.cursor_row) {
            if let Some(cell) = row.get_mut(self.cursor_col) {
                *cell = c;
            }
        }
        self.cursor_col += 1;
    }

    fn newline(&mut self) {
        self.cursor_col = 0;
        if self.cursor_row + 1 >= self.rows as usize {
            if self.scrollback.len() >= self.scrollback_capacity && self.scrollback_capacity > 0 {
                self.scrollback.pop_front();
            }
            if !self.grid.is_empty() {
                self.scrollback.push_back(self.grid.remove(0));
            }
            self.grid.push(vec![' '; self.cols as usize]);
        } else {
            self.cursor_row += 1;
        }
    }

    fn carriage_return(&mut self) {
        self.cursor_col = 0;
    }

    fn backspace(&mut self) {
        self.cursor_col = self.cursor_col.saturating_sub(1);
    }

    fn erase_in_display(&mut self, mode: u16) {
        match mode {
            2 | 3 => {
                for row in &mut self.grid {
                    row.iter_mut().for_each(|c| *c = ' ');
                }
                if mode == 3 {
                    self.scrollback.clear();
                }
            }
            0 => {
                if let Some(row) = self.grid.get_mut(self.cursor_row) {
                    for c in row.iter_mut().skip(self.cursor_col) {
                        *c = ' ';
                    }
                }
                for row in self.grid.iter_mut().skip(self.cursor_row + 1) {
                    row.iter_mut().for_each(|c| *c = ' ');
                }
            }
            1 => {
                if let Some(row) = self.grid.get_mut(self.cursor_row) {
                    for c in row.iter_mut().take(self.cursor_col + 1) {
                        *c = ' ';
                    }
                }
                for row in self.grid.iter_mut().take(self.cursor_row) {
                    row.iter_mut().for_each(|c| *c = ' ');
                }
            }
            _ => {}
        }
    }

    fn erase_in_line(&mut self, mode: u16) {
        let Some(row) = self.grid.get_mut(self.cursor_row) else {
            return;
        };
        match mode {
            0 => row.iter_mut().skip(self.cursor_col).for_each(|c| *c = ' '),
            1 => row.iter_mut().take(self.cursor_col + 1).for_each(|c| *c = ' '),
            2 => row.iter_mut().for_each(|c| *c = ' '),
            _ => {}
        }
    }

    fn set_mode(&mut self, codes: &[u16], on: bool) {
        for &code in codes {
            if !TRACKED_DEC_MODES.contains(&code) {
                continue;
            }
            if code == 47 || code == 1049 {
                self.toggle_alt_screen(on);
            }
            self.modes.insert(code, on);
        }
    }

    fn toggle_alt_screen(&mut self, on: bool) {
        if on {
            if self.alt_grid.is_none() {
                self.alt_grid = Some(std::mem::replace(&mut self.grid, blank_grid(self.cols, self.rows)));
            }
        } else if let Some(primary) = self.alt_grid.take() {
            self.grid = primary;
        }
    }

    fn handle_osc7(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let path = text
            .strip_prefix("file://")
            .and_then(|rest| rest.split_once('/'))
            .map(|(_, path)| format!("/{path}"))
            .unwrap_or_else(|| text.to_string());
        self.cwd = Some(percent_decode(&path));
    }

    /// Renders a byte string that, written to a fresh identical-geometry
    /// emulator, reconstructs the visible screen and scrollback (spec.md
    /// §4.C snapshot). Scrollback lines are replayed oldest-first ahead of
    /// the grid so a real terminal scrolls them up and leaves the grid
    /// content at the bottom, matching the live display.
    fn render_ansi(&self) -> String {
        let mut out = String::new();
        out.push_str("\x1b[2J\x1b[H");
        for row in &self.scrollback {
            let line: String = row.iter().collect();
            out.push_str(line.trim_end());
            out.push_str("\r\n");
        }
        for (i, row) in self.grid.iter().enumerate() {
            if i > 0 {
                out.push_str("\r\n");
            }
            let line: String = row.iter().collect();
            out.push_str(line.trim_end());
        }
        out.push_str(&format!(
            "\x1b[{};{}H",
            self.cursor_row + 1,
            self.cursor_col + 1
        ));
        out
    }

    /// Minimal DEC SET/RESET strings needed to restore non-default modes.
    /// Alternate-screen mode is intentionally excluded — the snapshot bytes
    /// already encode the correct buffer (spec.md §4.C).
    fn rehydrate_sequences(&self) -> Vec<String> {
        let defaults: HashMap<u16, bool> = TRACKED_DEC_MODES
            .iter()
            .map(|&m| (m, DEFAULT_ON_MODES.contains(&m)))
            .collect();
        let mut seqs = Vec::new();
        for &mode in TRACKED_DEC_MODES {
            if mode == 47 || mode == 1049 {
                continue;
            }
            let on = self.mode_state(mode);
            if on != defaults[&mode] {
                seqs.push(format!("\x1b[?{}{}", mode, if on { "h" } else { "l" }));
            }
        }
        seqs
    }
}

/// Decodes `%XX` escapes in an OSC-7 path. Invalid escapes pass through
/// unchanged rather than erroring — a malformed sequence here is cosmetic.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
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

fn blank_grid(cols: u16, rows: u16) -> Vec<Vec<char>> {
    vec![vec![' '; cols as usize]; rows as usize]
}

fn params_as_u16(params: &Params) -> Vec<u16> {
    params.iter().flat_map(|p| p.iter().copied()).collect()
}

impl Perform for GridPerform {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.carriage_return(),
            0x08 => self.backspace(),
            _ => {}
        }
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        if params.len() >= 2 && params[0] == b"7" {
            self.handle_osc7(params[1]);
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let nums = params_as_u16(params);
        let private = intermediates.first() == Some(&b'?');
        match (private, action) {
            (true, 'h') => self.set_mode(&nums, true),
            (true, 'l') => self.set_mode(&nums, false),
            (false, 'J') => self.erase_in_display(*nums.first().unwrap_or(&0)),
            (false, 'K') => self.erase_in_line(*nums.first().unwrap_or(&0)),
            (false, 'H') | (false, 'f') => {
                let row = nums.first().copied().unwrap_or(1).max(1) - 1;
                let col = nums.get(1).copied().unwrap_or(1).max(1) - 1;
                self.cursor_row = (row as usize).min(self.rows.saturating_sub(1) as usize);
                self.cursor_col = (col as usize).min(self.cols.saturating_sub(1) as usize);
            }
            (false, 'A') => {
                let n = nums.first().copied().unwrap_or(1).max(1) as usize;
                self.cursor_row = self.cursor_row.saturating_sub(n);
            }
            (false, 'B') => {
                let n = nums.first().copied().unwrap_or(1).max(1) as usize;
                self.cursor_row = (self.cursor_row + n).min(self.rows.saturating_sub(1) as usize);
            }
            (false, 'C') => {
                let n = nums.first().copied().unwrap_or(1).max(1) as usize;
                self.cursor_col = (self.cursor_col + n).min(self.cols.saturating_sub(1) as usize);
            }
            (false, 'D') => {
                let n = nums.first().copied().unwrap_or(1).max(1) as usize;
                self.cursor_col = self.cursor_col.saturating_sub(n);
            }
            // Cursor Position Report query: a headless session has no real
            // terminal to answer this, so the emulator answers for it.
            (false, 'n') if nums.first() == Some(&6) => {
                self.queue_reply(&format!(
                    "\x1b[{};{}R",
                    self.cursor_row + 1,
                    self.cursor_col + 1
                ));
            }
            // Primary Device Attributes query (no `>` intermediate).
            (false, 'c') if intermediates.is_empty() => {
                self.queue_reply("\x1b[?6c");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_text_into_grid() {
        let mut e = Emulator::new(10, 3, 1000);
        e.feed(b"hi");
        let snap = e.snapshot();
        assert!(snap.snapshot_ansi.contains("hi"));
    }

    #[test]
    fn newline_wraps_and_scrolls() {
        let mut e = Emulator::new(5, 2, 1000);
        e.feed(b"row1\r\nrow2\r\nrow3");
        assert_eq!(e.scrollback_lines(), 1);
    }

    #[test]
    fn tracks_dec_private_mode_bracketed_paste() {
        let mut e = Emulator::new(80, 24, 1000);
        assert!(!e.mode(2004));
        e.feed(b"\x1b[?2004h");
        assert!(e.mode(2004));
        e.feed(b"\x1b[?2004l");
        assert!(!e.mode(2004));
    }

    #[test]
    fn default_on_modes_start_enabled() {
        let e = Emulator::new(80, 24, 1000);
        assert!(e.mode(7));
        assert!(e.mode(25));
        assert!(!e.mode(1000));
    }

    #[test]
    fn osc7_updates_cwd() {
        let mut e = Emulator::new(80, 24, 1000);
        e.feed(b"\x1b]7;file://host/home/user/project\x07");
        assert_eq!(e.cwd(), Some("/home/user/project"));
    }

    #[test]
    fn erase_scrollback_sequence_clears_scrollback_only() {
        let mut e = Emulator::new(5, 2, 1000);
        e.feed(b"row1\r\nrow2\r\nrow3");
        assert_eq!(e.scrollback_lines(), 1);
        e.feed(b"\x1b[3J");
        assert_eq!(e.scrollback_lines(), 0);
        // visible grid is untouched by clearing scrollback via erase-in-display(3)
        let snap = e.snapshot();
        assert!(snap.snapshot_ansi.contains("row"));
    }

    #[test]
    fn clear_scrollback_api_leaves_grid_intact() {
        let mut e = Emulator::new(5, 2, 1000);
        e.feed(b"row1\r\nrow2\r\nrow3");
        e.clear_scrollback();
        assert_eq!(e.scrollback_lines(), 0);
        assert!(e.snapshot().snapshot_ansi.contains("row"));
    }

    #[test]
    fn rehydrate_sequences_only_list_non_default_modes() {
        let mut e = Emulator::new(80, 24, 1000);
        e.feed(b"\x1b[?2004h");
        let seqs = e.snapshot().rehydrate_sequences;
        assert_eq!(seqs, vec!["\x1b[?2004h".to_string()]);
    }

    #[test]
    fn alternate_screen_swap_round_trips_primary_content() {
        let mut e = Emulator::new(5, 2, 1000);
        e.feed(b"prim1");
        e.feed(b"\x1b[?1049h");
        e.feed(b"\x1b[Halt12");
        assert!(e.snapshot().snapshot_ansi.contains("alt12"));
        e.feed(b"\x1b[?1049l");
        assert!(e.snapshot().snapshot_ansi.contains("prim1"));
    }

    #[test]
    fn snapshot_ansi_includes_scrollback() {
        let mut e = Emulator::new(5, 2, 1000);
        e.feed(b"row1\r\nrow2\r\nrow3");
        assert_eq!(e.scrollback_lines(), 1);
        let snap = e.snapshot();
        // scrolled-off "row1" must survive into the snapshot, not just the
        // still-visible "row2"/"row3".
        assert!(snap.snapshot_ansi.contains("row1"));
        assert!(snap.snapshot_ansi.contains("row3"));
    }

    #[test]
    fn cursor_position_report_query_queues_reply() {
        let mut e = Emulator::new(80, 24, 1000);
        e.feed(b"\x1b[5;10H");
        e.feed(b"\x1b[6n");
        let reply = e.drain_pending_replies();
        assert_eq!(reply, b"\x1b[5;10R".to_vec());
        assert!(e.drain_pending_replies().is_empty(), "reply is drained exactly once");
    }

    #[test]
    fn device_attributes_query_queues_reply() {
        let mut e = Emulator::new(80, 24, 1000);
        e.feed(b"\x1b[c");
        assert_eq!(e.drain_pending_replies(), b"\x1b[?6c".to_vec());
    }

    #[test]
    fn resize_preserves_cursor_within_bounds() {
        let mut e = Emulator::new(10, 5, 1000);
        e.resize(3, 2);
        let snap = e.snapshot();
        assert_eq!(snap.cols, 3);
        assert_eq!(snap.rows, 2);
    }
}
