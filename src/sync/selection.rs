//! Cursor/selection mapping
//!
//! Turns the remote cursor (mode, position, visual anchor) into a host
//! selection. Block-caret modes show the character under the cursor as a
//! one-wide selection; caret modes show a zero-width selection. Selections
//! wider than one character are never touched, so a selection made with the
//! mouse survives the adjustment.

use crate::api::BytePosition;
use crate::rpc::{Buffer, DecodeError, Value};
use crate::sync::text::{TextPosition, char_len, to_text_position};

/// Synthetic notification published on cursor and mode changes
pub const CURSOR_EVENT: &str = "mirror_cursor";

/// Expressions evaluated remotely for [`CURSOR_EVENT`], in argument order
pub const CURSOR_EVENT_ARGS: [&str; 4] = ["bufnr()", "mode(1)", "getpos('.')", "getpos('v')"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Normal,
    Insert,
    Replace,
    VisualChar,
    VisualLine,
    VisualBlock,
    Command,
    Other,
}

impl Mode {
    /// Classify a `mode(1)` string
    pub fn from_mode_str(mode: &str) -> Self {
        match mode.chars().next() {
            Some('n') => Mode::Normal,
            Some('i') => Mode::Insert,
            Some('R') => Mode::Replace,
            Some('v') | Some('s') => Mode::VisualChar,
            Some('V') | Some('S') => Mode::VisualLine,
            Some('\x16') | Some('\x13') => Mode::VisualBlock,
            Some('c') => Mode::Command,
            _ => Mode::Other,
        }
    }

    pub fn is_visual(self) -> bool {
        matches!(self, Mode::VisualChar | Mode::VisualLine | Mode::VisualBlock)
    }

    /// Modes drawn with a bar caret between characters
    pub fn has_caret(self) -> bool {
        matches!(self, Mode::Insert | Mode::Replace)
    }
}

/// Host selection, always normalised so `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct SelectionRange {
    pub start: TextPosition,
    pub end: TextPosition,
}

impl SelectionRange {
    /// Range between two positions in either order
    pub fn new(a: TextPosition, b: TextPosition) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn caret(position: TextPosition) -> Self {
        Self::new(position, position)
    }

    pub fn on_line(line: usize, start_col: usize, end_col: usize) -> Self {
        Self::new(
            TextPosition::new(line, start_col),
            TextPosition::new(line, end_col),
        )
    }

    pub fn is_single_line(&self) -> bool {
        self.start.line == self.end.line
    }

    /// Width in chars; only meaningful on a single line
    pub fn width(&self) -> usize {
        self.end.col.saturating_sub(self.start.col)
    }
}

/// Remote cursor as published by [`CURSOR_EVENT`]
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub buffer: Buffer,
    pub mode: Mode,
    pub cursor: BytePosition,
    /// Other end of the visual selection; only set in visual modes
    pub anchor: Option<BytePosition>,
}

impl RemoteCursor {
    /// Parse `[bufnr, mode, getpos('.'), getpos('v')]`
    ///
    /// `getpos` yields `[bufnum, lnum, col, off]` with 1-based line and byte
    /// column.
    pub fn from_params(params: &[Value]) -> Result<Self, DecodeError> {
        let [buffer, mode, cursor, anchor] = params else {
            return Err(invalid(format!("expected 4 arguments, got {}", params.len())));
        };
        let buffer = buffer
            .as_buffer()
            .ok_or_else(|| invalid(format!("bad buffer {buffer}")))?;
        let mode = Mode::from_mode_str(
            mode.as_str()
                .ok_or_else(|| invalid(format!("bad mode {mode}")))?,
        );
        let cursor = parse_getpos(cursor)?;
        let anchor = if mode.is_visual() {
            Some(parse_getpos(anchor)?)
        } else {
            None
        };
        Ok(Self {
            buffer,
            mode,
            cursor,
            anchor,
        })
    }

    /// Host coordinates against the mirrored lines
    ///
    /// `None` if a position names a line the host does not have.
    pub fn to_cursor_state(&self, lines: &[String]) -> Option<CursorState> {
        let cursor = to_text_position(self.cursor, lines)?;
        let anchor = match self.anchor {
            Some(anchor) => Some(to_text_position(anchor, lines)?),
            None => None,
        };
        Some(CursorState {
            mode: self.mode,
            cursor,
            anchor,
        })
    }
}

fn parse_getpos(value: &Value) -> Result<BytePosition, DecodeError> {
    let position = match value.as_array() {
        Some([_, line, col, ..]) => line.as_i64().zip(col.as_i64()),
        _ => None,
    };
    match position {
        Some((line, col)) if line >= 1 => {
            Ok(BytePosition::new(line as usize - 1, (col.max(1) - 1) as usize))
        }
        _ => Err(invalid(format!("bad position {value}"))),
    }
}

fn invalid(reason: String) -> DecodeError {
    DecodeError::InvalidMessage(format!("{CURSOR_EVENT}: {reason}"))
}

/// Cursor in host coordinates; replaces the previous state wholesale
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CursorState {
    pub mode: Mode,
    pub cursor: TextPosition,
    pub anchor: Option<TextPosition>,
}

/// Adjust a raw selection for display in `mode`
pub fn adjust_selection(range: SelectionRange, mode: Mode, lines: &[String]) -> SelectionRange {
    if !range.is_single_line() || mode.is_visual() {
        return range;
    }

    if mode.has_caret() {
        return match range.width() {
            1 => SelectionRange::caret(range.start),
            _ => range,
        };
    }

    if range.width() > 0 {
        return range;
    }
    let Some(line) = lines.get(range.start.line) else {
        return range;
    };
    let line_len = char_len(line);
    let row = range.start.line;
    let col = range.start.col;
    if col < line_len {
        SelectionRange::on_line(row, col, col + 1)
    } else if line_len > 0 {
        SelectionRange::on_line(row, line_len - 1, line_len)
    } else {
        SelectionRange::on_line(row, 0, 1)
    }
}

/// Host selection showing `state`
pub fn selection_for_cursor(state: &CursorState, lines: &[String]) -> Option<SelectionRange> {
    let line_len = |line: usize| lines.get(line).map(|text| char_len(text));
    line_len(state.cursor.line)?;

    let anchor = match (state.mode.is_visual(), state.anchor) {
        (true, Some(anchor)) => {
            line_len(anchor.line)?;
            anchor
        }
        _ => {
            let caret = SelectionRange::caret(state.cursor);
            return Some(adjust_selection(caret, state.mode, lines));
        }
    };

    let ordered = SelectionRange::new(anchor, state.cursor);
    let range = match state.mode {
        Mode::VisualLine => SelectionRange::new(
            TextPosition::new(ordered.start.line, 0),
            TextPosition::new(ordered.end.line, line_len(ordered.end.line)?),
        ),
        // Block selections cannot be represented by the host and are
        // flattened to the character range between their corners
        _ => {
            let end_len = line_len(ordered.end.line)?;
            SelectionRange::new(
                ordered.start,
                TextPosition::new(ordered.end.line, (ordered.end.col + 1).min(end_len)),
            )
        }
    };
    Some(range)
}
