//! Frame delta generation.
//!
//! A [`Display`] turns a pair of framebuffers into the shortest practical
//! control-sequence string transforming one into the other, along with the
//! terminal setup and cleanup strings bracketing a session.

use std::fmt::Write;

use super::framebuffer::{Cell, Color, Framebuffer};

/// Generates terminal output: session open/close strings and frame deltas.
pub struct Display {
    /// Whether the attached terminal is assumed to understand the richer
    /// initialization sequences (alternate screen, cursor-key modes).
    terminal_aware: bool,
}

impl Display {
    pub fn new(terminal_aware: bool) -> Self {
        Self { terminal_aware }
    }

    /// Session prologue: switch to the alternate screen and enable
    /// application cursor key mode.
    pub fn open(&self) -> String {
        if self.terminal_aware {
            "\x1b[?1049h\x1b[?1h".to_string()
        } else {
            String::new()
        }
    }

    /// Session epilogue: restore modes, attributes, and the primary screen.
    pub fn close(&self) -> String {
        if self.terminal_aware {
            "\x1b[?1l\x1b[0m\x1b[?25h\x1b[?1049l".to_string()
        } else {
            "\x1b[0m\x1b[?25h".to_string()
        }
    }

    /// Produce a delta transforming `old` into `new`.
    ///
    /// With `initialized == false` the old framebuffer is ignored and a
    /// full repaint is emitted (clear, redraw every non-blank cell, restore
    /// cursor). Dimension changes force a full repaint as well.
    pub fn new_frame(&self, initialized: bool, old: &Framebuffer, new: &Framebuffer) -> String {
        let full = !initialized
            || old.width() != new.width()
            || old.height() != new.height();

        let mut frame = FrameWriter::new();
        if full {
            frame.out.push_str("\x1b[0m\x1b[H\x1b[2J");
            for row in 0..new.height() {
                for col in 0..new.width() {
                    let cell = new.cell(row, col);
                    if !cell.is_blank() {
                        frame.put(row, col, cell);
                    }
                }
            }
        } else {
            for row in 0..new.height() {
                for col in 0..new.width() {
                    let cell = new.cell(row, col);
                    if cell != old.cell(row, col) {
                        frame.put(row, col, cell);
                    }
                }
            }
        }

        frame.finish(new, initialized && !full, old)
    }
}

/// Accumulates cell writes, eliding redundant cursor moves and SGR churn.
struct FrameWriter {
    out: String,
    pen: Option<Cell>,
    // position the terminal cursor will be at after `out`, if known
    at: Option<(usize, usize)>,
}

impl FrameWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            pen: None,
            at: None,
        }
    }

    fn put(&mut self, row: usize, col: usize, cell: Cell) {
        if self.at != Some((row, col)) {
            let _ = write!(self.out, "\x1b[{};{}H", row + 1, col + 1);
        }
        self.apply_pen(cell);
        if cell.ch != '\0' {
            self.out.push(cell.ch);
        }
        // wide-glyph continuation cells advance with their leader
        self.at = Some((row, col + 1));
    }

    fn apply_pen(&mut self, cell: Cell) {
        let same = matches!(self.pen, Some(p) if p.fg == cell.fg
            && p.bg == cell.bg
            && p.bold == cell.bold
            && p.underline == cell.underline
            && p.reverse == cell.reverse);
        if same {
            return;
        }
        self.out.push_str("\x1b[0");
        if cell.bold {
            self.out.push_str(";1");
        }
        if cell.underline {
            self.out.push_str(";4");
        }
        if cell.reverse {
            self.out.push_str(";7");
        }
        if let Color::Indexed(n) = cell.fg {
            let _ = write!(self.out, ";38;5;{n}");
        }
        if let Color::Indexed(n) = cell.bg {
            let _ = write!(self.out, ";48;5;{n}");
        }
        self.out.push('m');
        self.pen = Some(cell);
    }

    fn finish(mut self, new: &Framebuffer, diffed: bool, old: &Framebuffer) -> String {
        let mut trailer = String::new();
        let moved_cells = !self.out.is_empty();

        if moved_cells || !diffed || old.cursor != new.cursor {
            let _ = write!(
                trailer,
                "\x1b[{};{}H",
                new.cursor.row + 1,
                new.cursor.col + 1
            );
        }
        if moved_cells {
            trailer.push_str("\x1b[0m");
        }
        if !diffed || old.cursor_visible != new.cursor_visible {
            trailer.push_str(if new.cursor_visible {
                "\x1b[?25h"
            } else {
                "\x1b[?25l"
            });
        }

        self.out.push_str(&trailer);
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::emulator::Emulator;

    fn fb_from(bytes: &[u8], w: usize, h: usize) -> Framebuffer {
        let mut emu = Emulator::new(w, h);
        emu.perform(bytes);
        emu.framebuffer().clone()
    }

    /// Applying a delta to a terminal in the `old` state must reproduce
    /// `new`; round-tripping the delta through a second emulator checks
    /// that without eyeballing escape sequences.
    fn assert_delta_faithful(old: &Framebuffer, new: &Framebuffer) {
        let display = Display::new(true);
        let delta = display.new_frame(true, old, new);

        let mut replay = Emulator::new(new.width(), new.height());
        let prime = display.new_frame(false, old, old);
        replay.perform(prime.as_bytes());
        replay.perform(delta.as_bytes());

        for row in 0..new.height() {
            for col in 0..new.width() {
                assert_eq!(
                    replay.framebuffer().cell(row, col),
                    new.cell(row, col),
                    "cell mismatch at ({row}, {col})"
                );
            }
        }
        assert_eq!(replay.framebuffer().cursor, new.cursor);
    }

    #[test]
    fn test_identical_frames_emit_nothing_visible() {
        let fb = fb_from(b"hello", 10, 3);
        let display = Display::new(true);
        let delta = display.new_frame(true, &fb, &fb);
        // no cell writes; at most a cursor sync
        assert!(!delta.contains("hello"));
    }

    #[test]
    fn test_full_repaint_when_uninitialized() {
        let fb = fb_from(b"hi", 10, 3);
        let display = Display::new(true);
        let delta = display.new_frame(false, &fb, &fb);
        assert!(delta.contains("\x1b[2J"));
        assert!(delta.contains('h'));
        assert!(delta.contains('i'));
    }

    #[test]
    fn test_single_cell_change() {
        let old = fb_from(b"cat", 10, 3);
        let new = fb_from(b"car", 10, 3);
        assert_delta_faithful(&old, &new);
        let delta = Display::new(true).new_frame(true, &old, &new);
        assert!(delta.contains('r'));
        assert!(!delta.contains("ca"));
    }

    #[test]
    fn test_styled_change_roundtrips() {
        let old = fb_from(b"plain", 20, 3);
        let new = fb_from(b"\x1b[1;31mloud\x1b[0m!", 20, 3);
        assert_delta_faithful(&old, &new);
    }

    #[test]
    fn test_multiline_roundtrips() {
        let old = fb_from(b"one\r\ntwo", 10, 4);
        let new = fb_from(b"one\r\nTWO\r\nthree", 10, 4);
        assert_delta_faithful(&old, &new);
    }

    #[test]
    fn test_open_close_bracket_alt_screen() {
        let display = Display::new(true);
        assert!(display.open().contains("?1049h"));
        assert!(display.close().contains("?1049l"));
        assert!(display.close().contains("?25h"));
    }
}
