//! Speculative local echo overlay.
//!
//! The engine stages per-keystroke predictions against the frame last
//! shown to the client, then retires them as authoritative server state
//! arrives. Staged predictions are painted by [`PredictionEngine::apply`]
//! during delta generation; they are tracked per confirmation epoch, and
//! once the epoch that carried a keystroke has been acknowledged the
//! server's framebuffer is expected to show its echo, so the prediction is
//! culled whether it was right or wrong.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::framebuffer::Framebuffer;

/// When to show predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPreference {
    /// Never display predictions.
    Never,

    /// Display only when the measured round trip is long enough to matter.
    Adaptive,

    /// Always display predictions.
    Always,

    /// Always display, including the more speculative edits.
    Experimental,
}

impl DisplayPreference {
    /// Parse the wire form used by the `displayPreference` channel request.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Some(Self::Never),
            "adaptive" => Some(Self::Adaptive),
            "always" => Some(Self::Always),
            "experimental" => Some(Self::Experimental),
            _ => None,
        }
    }
}

/// Round trips above this make adaptive mode display predictions.
const ADAPTIVE_THRESHOLD: Duration = Duration::from_millis(50);

/// Round trips above this mark predictions visually (underline).
const FLAG_THRESHOLD: Duration = Duration::from_millis(80);

#[derive(Debug, Clone, Copy)]
struct PredictedCell {
    row: usize,
    col: usize,
    ch: char,
    /// The epoch whose acknowledgement should confirm this prediction:
    /// one past the last frame sent when the keystroke was staged.
    epoch: u64,
}

/// The prediction overlay engine.
pub struct PredictionEngine {
    preference: DisplayPreference,
    predict_overwrite: bool,

    cells: Vec<PredictedCell>,
    /// Predicted cursor, present while any speculation is live.
    cursor: Option<(usize, usize)>,

    last_sent: u64,
    sent_at: HashMap<u64, Instant>,
    srtt: Option<Duration>,
}

impl PredictionEngine {
    pub fn new(preference: DisplayPreference, predict_overwrite: bool) -> Self {
        Self {
            preference,
            predict_overwrite,
            cells: Vec::new(),
            cursor: None,
            last_sent: 0,
            sent_at: HashMap::new(),
            srtt: None,
        }
    }

    pub fn set_display_preference(&mut self, preference: DisplayPreference) {
        self.preference = preference;
    }

    pub fn display_preference(&self) -> DisplayPreference {
        self.preference
    }

    pub fn set_predict_overwrite(&mut self, overwrite: bool) {
        self.predict_overwrite = overwrite;
    }

    /// Whether new predictions should currently be staged at all.
    fn active(&self) -> bool {
        match self.preference {
            DisplayPreference::Never => false,
            DisplayPreference::Always | DisplayPreference::Experimental => true,
            DisplayPreference::Adaptive => {
                matches!(self.srtt, Some(rtt) if rtt >= ADAPTIVE_THRESHOLD)
            }
        }
    }

    /// Whether displayed predictions get the visual marker. Only flagged
    /// once the link is measurably slow; confirmed echoes then replace the
    /// marked glyphs without any visible change beyond the marker.
    fn flagging(&self) -> bool {
        matches!(self.srtt, Some(rtt) if rtt >= FLAG_THRESHOLD)
    }

    /// Stage the predicted effect of one user byte. `fb` is the frame last
    /// shown to the client and provides the context (dimensions, occupied
    /// cells, cursor when no speculation is live); the visible effect is
    /// painted later by [`apply`](Self::apply).
    pub fn new_user_byte(&mut self, byte: u8, fb: &Framebuffer) {
        if !self.active() {
            return;
        }
        let epoch = self.last_sent + 1;
        let (mut row, mut col) = self.cursor.unwrap_or((fb.cursor.row, fb.cursor.col));

        match byte {
            0x20..=0x7e => {
                let occupied = fb.cell(row, col).ch != ' '
                    && !self.cells.iter().any(|p| p.row == row && p.col == col);
                if occupied && !self.predict_overwrite {
                    // only the cursor moves; the glyph is left to the server
                    self.cursor = Some((row, (col + 1).min(fb.width() - 1)));
                    return;
                }
                self.cells.push(PredictedCell {
                    row,
                    col,
                    ch: byte as char,
                    epoch,
                });
                col = (col + 1).min(fb.width() - 1);
                self.cursor = Some((row, col));
            }
            0x7f | 0x08 => {
                col = col.saturating_sub(1);
                // a locally-predicted glyph is erased outright
                if let Some(idx) = self
                    .cells
                    .iter()
                    .rposition(|p| p.row == row && p.col == col)
                {
                    self.cells.remove(idx);
                }
                self.cursor = Some((row, col));
            }
            b'\r' => {
                self.cursor = Some((row, 0));
            }
            b'\n' => {
                row = (row + 1).min(fb.height() - 1);
                self.cursor = Some((row, col));
            }
            _ => {
                // control bytes have unknowable effects; drop speculation
                self.reset();
            }
        }
    }

    /// Retire predictions against the authoritative framebuffer: confirmed
    /// glyphs and predictions whose epoch has been acknowledged both drop.
    pub fn cull(&mut self, fb: &Framebuffer) {
        if self.preference == DisplayPreference::Never {
            self.reset();
            return;
        }
        let acked = self.last_acked();
        self.cells.retain(|p| {
            if p.row >= fb.height() || p.col >= fb.width() {
                return false;
            }
            if fb.cell(p.row, p.col).ch == p.ch {
                // the server now shows it; authoritative wins
                return false;
            }
            p.epoch > acked
        });
        if self.cells.is_empty() {
            self.cursor = None;
        }
    }

    /// Paint the surviving predictions onto `fb`.
    pub fn apply(&self, fb: &mut Framebuffer) {
        let flag = self.flagging();
        for p in &self.cells {
            if let Some(cell) = fb.cell_mut(p.row, p.col) {
                cell.ch = p.ch;
                cell.underline = cell.underline || flag;
            }
        }
        if let Some((row, col)) = self.cursor {
            if row < fb.height() && col < fb.width() {
                fb.cursor.row = row;
                fb.cursor.col = col;
            }
        }
    }

    /// Record that the local frame for `epoch` has been sent upstream.
    pub fn local_frame_sent(&mut self, epoch: u64) {
        self.last_sent = self.last_sent.max(epoch);
        self.sent_at.entry(epoch).or_insert_with(Instant::now);
    }

    /// Record acknowledgement of `epoch`, updating the smoothed round trip.
    pub fn local_frame_acked(&mut self, epoch: u64) {
        if let Some(sent) = self.sent_at.remove(&epoch) {
            let sample = sent.elapsed();
            self.srtt = Some(match self.srtt {
                // standard 7/8 smoothing
                Some(prev) => (prev * 7 + sample) / 8,
                None => sample,
            });
        }
        self.sent_at.retain(|&e, _| e > epoch);
    }

    /// Late acknowledgement hook; retained for parity with the timing
    /// interface, currently identical in effect to a plain ack.
    pub fn local_frame_late_acked(&mut self, _epoch: u64) {}

    /// Discard all in-flight predictions.
    pub fn reset(&mut self) {
        self.cells.clear();
        self.cursor = None;
    }

    /// Highest epoch known to be acknowledged (all timing entries at or
    /// below it have been removed).
    fn last_acked(&self) -> u64 {
        match self.sent_at.keys().min() {
            Some(&lowest_outstanding) => lowest_outstanding.saturating_sub(1),
            None => self.last_sent,
        }
    }

    #[cfg(test)]
    fn live_predictions(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PredictionEngine {
        PredictionEngine::new(DisplayPreference::Experimental, true)
    }

    #[test]
    fn test_printable_byte_stages_and_applies() {
        let local = Framebuffer::new(10, 3);
        let mut eng = engine();
        eng.new_user_byte(b'x', &local);
        assert_eq!(eng.live_predictions(), 1);

        let mut shown = local.clone();
        eng.apply(&mut shown);
        assert_eq!(shown.cell(0, 0).ch, 'x');
        assert_eq!(shown.cursor.col, 1);
    }

    #[test]
    fn test_never_preference_stages_nothing() {
        let local = Framebuffer::new(10, 3);
        let mut eng = PredictionEngine::new(DisplayPreference::Never, true);
        eng.new_user_byte(b'x', &local);
        assert_eq!(eng.live_predictions(), 0);
    }

    #[test]
    fn test_cull_drops_confirmed_glyph() {
        let local = Framebuffer::new(10, 3);
        let mut eng = engine();
        eng.new_user_byte(b'x', &local);

        // server echoes the same glyph
        let mut remote = Framebuffer::new(10, 3);
        remote.cell_mut(0, 0).unwrap().ch = 'x';
        eng.cull(&remote);
        assert_eq!(eng.live_predictions(), 0);
    }

    #[test]
    fn test_cull_drops_acked_misprediction() {
        let local = Framebuffer::new(10, 3);
        let mut eng = engine();
        eng.local_frame_sent(1);
        eng.new_user_byte(b'x', &local); // staged against epoch 2

        let remote = Framebuffer::new(10, 3); // server shows nothing
        eng.cull(&remote);
        assert_eq!(eng.live_predictions(), 1, "unacked prediction survives");

        eng.local_frame_acked(1);
        eng.local_frame_sent(2);
        eng.local_frame_acked(2);
        eng.cull(&remote);
        assert_eq!(eng.live_predictions(), 0, "acked misprediction culled");
    }

    #[test]
    fn test_sequential_predictions_track_cursor() {
        let local = Framebuffer::new(10, 3);
        let mut eng = engine();
        eng.new_user_byte(b'a', &local);
        eng.new_user_byte(b'b', &local);

        let mut shown = local.clone();
        eng.apply(&mut shown);
        assert_eq!(shown.cell(0, 0).ch, 'a');
        assert_eq!(shown.cell(0, 1).ch, 'b');
        assert_eq!(shown.cursor.col, 2);
    }

    #[test]
    fn test_backspace_erases_prediction() {
        let local = Framebuffer::new(10, 3);
        let mut eng = engine();
        eng.new_user_byte(b'a', &local);
        eng.new_user_byte(0x7f, &local);
        assert_eq!(eng.live_predictions(), 0);

        let mut shown = local.clone();
        eng.apply(&mut shown);
        assert_eq!(shown.cell(0, 0).ch, ' ');
        assert_eq!(shown.cursor.col, 0);
    }

    #[test]
    fn test_reset_discards_everything() {
        let local = Framebuffer::new(10, 3);
        let mut eng = engine();
        eng.new_user_byte(b'a', &local);
        eng.reset();
        assert_eq!(eng.live_predictions(), 0);
        let mut shown = Framebuffer::new(10, 3);
        eng.apply(&mut shown);
        assert_eq!(shown.cell(0, 0).ch, ' ');
    }

    #[test]
    fn test_overwrite_disabled_skips_occupied_cell() {
        let mut local = Framebuffer::new(10, 3);
        local.cell_mut(0, 0).unwrap().ch = 'q';
        let mut eng = PredictionEngine::new(DisplayPreference::Always, false);
        eng.new_user_byte(b'x', &local);
        assert_eq!(eng.live_predictions(), 0);

        let mut shown = local.clone();
        eng.apply(&mut shown);
        assert_eq!(shown.cell(0, 0).ch, 'q');
        assert_eq!(shown.cursor.col, 1, "cursor still advances");
    }

    #[test]
    fn test_unflagged_until_link_is_slow() {
        let local = Framebuffer::new(10, 3);
        let mut eng = engine();
        eng.new_user_byte(b'x', &local);
        let mut shown = local.clone();
        eng.apply(&mut shown);
        assert!(!shown.cell(0, 0).underline, "no marker before rtt measured");
    }

    #[test]
    fn test_display_preference_parse() {
        assert_eq!(
            DisplayPreference::parse("Always"),
            Some(DisplayPreference::Always)
        );
        assert_eq!(
            DisplayPreference::parse("experimental"),
            Some(DisplayPreference::Experimental)
        );
        assert_eq!(DisplayPreference::parse("sometimes"), None);
    }
}
