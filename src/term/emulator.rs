//! Control-sequence processor maintaining a live framebuffer.
//!
//! Server-origin bytes go through [`Emulator::perform`]; locally-generated
//! events go through [`Emulator::act`]. Both return "terminal to host"
//! bytes that must be written back upstream (status report replies for
//! `perform`, the keystrokes themselves for `act`).

use unicode_width::UnicodeWidthChar;
use vte::{Params, Parser, Perform};

use super::framebuffer::{Cell, Color, Cursor, Framebuffer};

/// A locally-generated terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A single byte of user input destined for the host.
    UserByte(u8),

    /// A change of terminal dimensions (columns, rows).
    Resize(u16, u16),
}

/// Current SGR pen.
#[derive(Debug, Clone, Copy, Default)]
struct Pen {
    fg: Color,
    bg: Color,
    bold: bool,
    underline: bool,
    reverse: bool,
}

impl Pen {
    fn styled(&self, ch: char) -> Cell {
        Cell {
            ch,
            fg: self.fg,
            bg: self.bg,
            bold: self.bold,
            underline: self.underline,
            reverse: self.reverse,
        }
    }
}

/// The mutable screen state driven by the vte parser.
struct Screen {
    fb: Framebuffer,
    pen: Pen,
    scroll_top: usize,
    scroll_bottom: usize,
    saved_cursor: Option<(Cursor, Pen)>,

    /// Replies owed to the host (DSR, DA). Drained after each `perform`.
    replies: Vec<u8>,
}

impl Screen {
    fn new(width: usize, height: usize) -> Self {
        let fb = Framebuffer::new(width, height);
        let bottom = fb.height() - 1;
        Self {
            fb,
            pen: Pen::default(),
            scroll_top: 0,
            scroll_bottom: bottom,
            saved_cursor: None,
            replies: Vec::new(),
        }
    }

    fn resize(&mut self, width: usize, height: usize) {
        self.fb.resize(width, height);
        self.scroll_top = 0;
        self.scroll_bottom = self.fb.height() - 1;
    }

    fn linefeed(&mut self) {
        if self.fb.cursor.row == self.scroll_bottom {
            self.fb.scroll_up(self.scroll_top, self.scroll_bottom);
        } else if self.fb.cursor.row + 1 < self.fb.height() {
            self.fb.cursor.row += 1;
        }
    }

    fn reverse_linefeed(&mut self) {
        if self.fb.cursor.row == self.scroll_top {
            self.fb.scroll_down(self.scroll_top, self.scroll_bottom);
        } else if self.fb.cursor.row > 0 {
            self.fb.cursor.row -= 1;
        }
    }

    fn put_char(&mut self, ch: char) {
        let width = ch.width().unwrap_or(1).max(1);
        if self.fb.cursor.col + width > self.fb.width() {
            self.fb.cursor.col = 0;
            self.linefeed();
        }
        let Cursor { row, col } = self.fb.cursor;
        if let Some(cell) = self.fb.cell_mut(row, col) {
            *cell = self.pen.styled(ch);
        }
        for offset in 1..width {
            if let Some(cell) = self.fb.cell_mut(row, col + offset) {
                *cell = self.pen.styled('\0');
            }
        }
        self.fb.cursor.col = (col + width).min(self.fb.width());
        if self.fb.cursor.col == self.fb.width() {
            // wrap eagerly rather than holding a wrap-pending flag
            self.fb.cursor.col = 0;
            self.linefeed();
        }
    }

    fn apply_sgr(&mut self, params: &Params) {
        let mut iter = params.iter();
        if params.iter().next().is_none() {
            self.pen = Pen::default();
            return;
        }
        while let Some(param) = iter.next() {
            match param[0] {
                0 => self.pen = Pen::default(),
                1 => self.pen.bold = true,
                4 => self.pen.underline = true,
                7 => self.pen.reverse = true,
                22 => self.pen.bold = false,
                24 => self.pen.underline = false,
                27 => self.pen.reverse = false,
                30..=37 => self.pen.fg = Color::Indexed((param[0] - 30) as u8),
                38 => {
                    // 38;5;N indexed only; truecolor collapses to default
                    if param.len() >= 3 && param[1] == 5 {
                        self.pen.fg = Color::Indexed(param[2] as u8);
                    } else if let Some(next) = iter.next() {
                        if next[0] == 5 {
                            if let Some(idx) = iter.next() {
                                self.pen.fg = Color::Indexed(idx[0] as u8);
                            }
                        }
                    }
                }
                39 => self.pen.fg = Color::Default,
                40..=47 => self.pen.bg = Color::Indexed((param[0] - 40) as u8),
                48 => {
                    if param.len() >= 3 && param[1] == 5 {
                        self.pen.bg = Color::Indexed(param[2] as u8);
                    } else if let Some(next) = iter.next() {
                        if next[0] == 5 {
                            if let Some(idx) = iter.next() {
                                self.pen.bg = Color::Indexed(idx[0] as u8);
                            }
                        }
                    }
                }
                49 => self.pen.bg = Color::Default,
                90..=97 => self.pen.fg = Color::Indexed((param[0] - 90 + 8) as u8),
                100..=107 => self.pen.bg = Color::Indexed((param[0] - 100 + 8) as u8),
                _ => {}
            }
        }
    }

    fn set_private_mode(&mut self, params: &Params, enable: bool) {
        for param in params.iter() {
            match param[0] {
                1 => self.fb.application_cursor = enable,
                25 => self.fb.cursor_visible = enable,
                _ => {}
            }
        }
    }
}

fn param_or(params: &Params, index: usize, default: usize) -> usize {
    params
        .iter()
        .nth(index)
        .map(|p| p[0] as usize)
        .filter(|&v| v != 0)
        .unwrap_or(default)
}

impl Perform for Screen {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | 0x0b | 0x0c => self.linefeed(),
            b'\r' => self.fb.cursor.col = 0,
            0x08 => self.fb.cursor.col = self.fb.cursor.col.saturating_sub(1),
            b'\t' => {
                let next = (self.fb.cursor.col / 8 + 1) * 8;
                self.fb.cursor.col = next.min(self.fb.width() - 1);
            }
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let private = intermediates.first() == Some(&b'?');
        match (action, private) {
            ('A', _) => {
                let n = param_or(params, 0, 1);
                self.fb.cursor.row = self.fb.cursor.row.saturating_sub(n);
            }
            ('B', _) => {
                let n = param_or(params, 0, 1);
                self.fb.cursor.row = (self.fb.cursor.row + n).min(self.fb.height() - 1);
            }
            ('C', _) => {
                let n = param_or(params, 0, 1);
                self.fb.cursor.col = (self.fb.cursor.col + n).min(self.fb.width() - 1);
            }
            ('D', _) => {
                let n = param_or(params, 0, 1);
                self.fb.cursor.col = self.fb.cursor.col.saturating_sub(n);
            }
            ('G', _) => {
                self.fb.cursor.col = (param_or(params, 0, 1) - 1).min(self.fb.width() - 1);
            }
            ('H', _) | ('f', _) => {
                self.fb.cursor.row = (param_or(params, 0, 1) - 1).min(self.fb.height() - 1);
                self.fb.cursor.col = (param_or(params, 1, 1) - 1).min(self.fb.width() - 1);
            }
            ('d', _) => {
                self.fb.cursor.row = (param_or(params, 0, 1) - 1).min(self.fb.height() - 1);
            }
            ('J', _) => {
                let Cursor { row, col } = self.fb.cursor;
                match params.iter().next().map(|p| p[0]).unwrap_or(0) {
                    0 => {
                        self.fb.clear_row_span(row, col, self.fb.width() - 1);
                        if row + 1 < self.fb.height() {
                            self.fb.clear_rows(row + 1, self.fb.height() - 1);
                        }
                    }
                    1 => {
                        if row > 0 {
                            self.fb.clear_rows(0, row - 1);
                        }
                        self.fb.clear_row_span(row, 0, col);
                    }
                    2 | 3 => self.fb.clear_rows(0, self.fb.height() - 1),
                    _ => {}
                }
            }
            ('K', _) => {
                let Cursor { row, col } = self.fb.cursor;
                match params.iter().next().map(|p| p[0]).unwrap_or(0) {
                    0 => self.fb.clear_row_span(row, col, self.fb.width() - 1),
                    1 => self.fb.clear_row_span(row, 0, col),
                    2 => self.fb.clear_row_span(row, 0, self.fb.width() - 1),
                    _ => {}
                }
            }
            ('L', _) => {
                let n = param_or(params, 0, 1);
                for _ in 0..n {
                    self.fb.scroll_down(self.fb.cursor.row, self.scroll_bottom);
                }
            }
            ('M', _) => {
                let n = param_or(params, 0, 1);
                for _ in 0..n {
                    self.fb.scroll_up(self.fb.cursor.row, self.scroll_bottom);
                }
            }
            ('P', _) => {
                // DCH: shift the remainder of the row left
                let n = param_or(params, 0, 1);
                let Cursor { row, col } = self.fb.cursor;
                for _ in 0..n {
                    for c in col..self.fb.width() - 1 {
                        let next = self.fb.cell(row, c + 1);
                        if let Some(cell) = self.fb.cell_mut(row, c) {
                            *cell = next;
                        }
                    }
                    if let Some(cell) = self.fb.cell_mut(row, self.fb.width() - 1) {
                        *cell = Cell::default();
                    }
                }
            }
            ('@', _) => {
                // ICH: shift the remainder of the row right
                let n = param_or(params, 0, 1);
                let Cursor { row, col } = self.fb.cursor;
                for _ in 0..n {
                    for c in (col + 1..self.fb.width()).rev() {
                        let prev = self.fb.cell(row, c - 1);
                        if let Some(cell) = self.fb.cell_mut(row, c) {
                            *cell = prev;
                        }
                    }
                    if let Some(cell) = self.fb.cell_mut(row, col) {
                        *cell = Cell::default();
                    }
                }
            }
            ('S', _) => {
                let n = param_or(params, 0, 1);
                for _ in 0..n {
                    self.fb.scroll_up(self.scroll_top, self.scroll_bottom);
                }
            }
            ('T', _) => {
                let n = param_or(params, 0, 1);
                for _ in 0..n {
                    self.fb.scroll_down(self.scroll_top, self.scroll_bottom);
                }
            }
            ('r', false) => {
                let top = param_or(params, 0, 1) - 1;
                let bottom = param_or(params, 1, self.fb.height()) - 1;
                if top < bottom && bottom < self.fb.height() {
                    self.scroll_top = top;
                    self.scroll_bottom = bottom;
                    self.fb.cursor = Cursor::default();
                }
            }
            ('m', false) => self.apply_sgr(params),
            ('h', true) => self.set_private_mode(params, true),
            ('l', true) => self.set_private_mode(params, false),
            ('n', false) => match params.iter().next().map(|p| p[0]).unwrap_or(0) {
                5 => self.replies.extend_from_slice(b"\x1b[0n"),
                6 => {
                    let report =
                        format!("\x1b[{};{}R", self.fb.cursor.row + 1, self.fb.cursor.col + 1);
                    self.replies.extend_from_slice(report.as_bytes());
                }
                _ => {}
            },
            ('c', false) => {
                // DA: advertise a VT102-class terminal
                self.replies.extend_from_slice(b"\x1b[?6c");
            }
            ('s', false) => self.saved_cursor = Some((self.fb.cursor, self.pen)),
            ('u', false) => {
                if let Some((cursor, pen)) = self.saved_cursor {
                    self.fb.cursor = cursor;
                    self.pen = pen;
                    self.fb.clamp_cursor();
                }
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, byte: u8) {
        match byte {
            b'D' => self.linefeed(),
            b'E' => {
                self.fb.cursor.col = 0;
                self.linefeed();
            }
            b'M' => self.reverse_linefeed(),
            b'7' => self.saved_cursor = Some((self.fb.cursor, self.pen)),
            b'8' => {
                if let Some((cursor, pen)) = self.saved_cursor {
                    self.fb.cursor = cursor;
                    self.pen = pen;
                    self.fb.clamp_cursor();
                }
            }
            b'c' => {
                let (w, h) = (self.fb.width(), self.fb.height());
                *self = Screen::new(w, h);
            }
            _ => {}
        }
    }

    fn hook(&mut self, _: &Params, _: &[u8], _: bool, _: char) {}
    fn put(&mut self, _: u8) {}
    fn unhook(&mut self) {}
    fn osc_dispatch(&mut self, _: &[&[u8]], _: bool) {}
}

/// A terminal emulator: control-sequence parser plus live framebuffer.
pub struct Emulator {
    parser: Parser,
    screen: Screen,
}

impl Emulator {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            parser: Parser::new(),
            screen: Screen::new(width, height),
        }
    }

    /// Feed server-origin bytes through the parser. Returns any bytes the
    /// terminal owes the host (status report replies), possibly empty.
    pub fn perform(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.parser.advance(&mut self.screen, bytes);
        std::mem::take(&mut self.screen.replies)
    }

    /// Apply a locally-generated event. For [`Action::UserByte`] the byte
    /// itself is the terminal-to-host output; resizes produce none.
    pub fn act(&mut self, action: Action) -> Vec<u8> {
        match action {
            Action::UserByte(b) => vec![b],
            Action::Resize(cols, rows) => {
                self.screen.resize(cols as usize, rows as usize);
                Vec::new()
            }
        }
    }

    /// The live framebuffer.
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.screen.fb
    }
}
