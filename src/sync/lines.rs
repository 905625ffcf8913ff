//! Line-diff protocol adapter
//!
//! Remote → host: a buffer line event becomes one char-range replacement
//! against the mirrored text. Host → remote: the difference between two
//! line arrays becomes a list of line-range replacements, applied in order.

use std::ops::Range;

use similar::{Algorithm, DiffOp, capture_diff_slices};
use tracing::trace;

use crate::rpc::{Buffer, DecodeError, Value};
use crate::sync::text::LineIndex;

/// Notification carrying buffer line changes
pub const LINES_EVENT: &str = "nvim_buf_lines_event";

/// Which lines an event replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSpan {
    /// Full buffer contents follow; the old range is unknown
    WholeBuffer,
    /// Lines `[first, last)`
    Lines { first: usize, last: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineChangeEvent {
    pub buffer: Buffer,
    pub changedtick: Option<i64>,
    pub span: LineSpan,
    /// Replacement lines, without newlines
    pub lines: Vec<String>,
    /// More chunks of the same change follow
    pub more: bool,
}

impl LineChangeEvent {
    /// Parse `[buf, changedtick, firstline, lastline, linedata, more]`
    ///
    /// A `lastline` of `-1` is the whole-buffer sentinel. A nil changedtick
    /// means the change did not bump it.
    pub fn from_params(params: &[Value]) -> Result<Self, DecodeError> {
        let [buffer, changedtick, first, last, lines, more] = params else {
            return Err(invalid(format!(
                "expected 6 arguments, got {}",
                params.len()
            )));
        };

        let buffer = buffer
            .as_buffer()
            .ok_or_else(|| invalid(format!("bad buffer {buffer}")))?;
        let changedtick = match changedtick {
            Value::Nil => None,
            other => Some(
                other
                    .as_i64()
                    .ok_or_else(|| invalid(format!("bad changedtick {other}")))?,
            ),
        };
        let first = first
            .as_i64()
            .filter(|first| *first >= 0)
            .ok_or_else(|| invalid(format!("bad firstline {first}")))?;
        let span = match last.as_i64() {
            Some(-1) => LineSpan::WholeBuffer,
            Some(last) if last >= first => LineSpan::Lines {
                first: first as usize,
                last: last as usize,
            },
            _ => return Err(invalid(format!("bad lastline {last}"))),
        };
        let lines = lines
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|line| line.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| invalid("linedata is not a list of strings".to_string()))?;
        let more = more.as_bool().unwrap_or(false);

        Ok(Self {
            buffer,
            changedtick,
            span,
            lines,
            more,
        })
    }

    /// Empty replacement of an empty range; the remote emits these and they
    /// must never reach the text
    pub fn is_noop(&self) -> bool {
        matches!(self.span, LineSpan::Lines { first, last } if first == last)
            && self.lines.is_empty()
    }
}

fn invalid(reason: String) -> DecodeError {
    DecodeError::InvalidMessage(format!("{LINES_EVENT}: {reason}"))
}

/// Replacement of a char range of the host text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPatch {
    pub range: Range<usize>,
    pub replacement: String,
}

impl TextPatch {
    pub fn apply(&self, text: &str) -> String {
        let start = byte_offset(text, self.range.start);
        let end = byte_offset(text, self.range.end);
        let mut patched = String::with_capacity(text.len() + self.replacement.len());
        patched.push_str(&text[..start]);
        patched.push_str(&self.replacement);
        patched.push_str(&text[end..]);
        patched
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(offset, _)| offset)
}

/// Char-range replacement equivalent to `event` applied to `text`
///
/// `None` when the event changes nothing.
pub fn patch_for_event(event: &LineChangeEvent, text: &str) -> Option<TextPatch> {
    if event.is_noop() {
        return None;
    }

    let index = LineIndex::new(text);
    let joined = event.lines.join("\n");

    let (first, last) = match event.span {
        LineSpan::WholeBuffer => {
            return Some(TextPatch {
                range: 0..index.len(),
                replacement: joined,
            });
        }
        LineSpan::Lines { first, last } => (first, last.min(index.line_count())),
    };
    let line_count = index.line_count();

    if event.lines.is_empty() {
        if first >= last {
            trace!("patch_for_event: deletion of missing lines {}..{}", first, last);
            return None;
        }
        let start = index.line_start(first)?;
        let end = index.line_end(last - 1)?;
        let range = if first > 0 {
            // Take the newline that ended the previous line
            start - 1..end
        } else if last < line_count {
            start..index.line_start(last)?
        } else {
            0..index.len()
        };
        return Some(TextPatch {
            range,
            replacement: String::new(),
        });
    }

    if first >= line_count {
        return Some(TextPatch {
            range: index.len()..index.len(),
            replacement: format!("\n{joined}"),
        });
    }

    let start = index.line_start(first)?;
    if first >= last {
        return Some(TextPatch {
            range: start..start,
            replacement: format!("{joined}\n"),
        });
    }

    let end = index.line_end(last - 1)?;
    Some(TextPatch {
        range: start..end,
        replacement: joined,
    })
}

/// One remote line replacement: lines `[start, end)` become `replacement`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEdit {
    pub start: usize,
    pub end: usize,
    pub replacement: Vec<String>,
}

/// Line replacements turning `old` into `new` when applied in order
///
/// A single changed line yields one replacement of that line; anything else
/// follows a Myers diff, each operation positioned in the partially updated
/// buffer.
pub fn plan_line_edits(old: &[String], new: &[String]) -> Vec<LineEdit> {
    if old.len() == new.len() {
        let mut changed = old.iter().zip(new).enumerate().filter(|(_, (a, b))| a != b);
        if let (Some((index, _)), None) = (changed.next(), changed.next()) {
            return vec![LineEdit {
                start: index,
                end: index + 1,
                replacement: vec![new[index].clone()],
            }];
        }
    }

    capture_diff_slices(Algorithm::Myers, old, new)
        .into_iter()
        .filter_map(|op| match op {
            DiffOp::Equal { .. } => None,
            DiffOp::Delete {
                old_len, new_index, ..
            } => Some(LineEdit {
                start: new_index,
                end: new_index + old_len,
                replacement: Vec::new(),
            }),
            DiffOp::Insert {
                new_index, new_len, ..
            } => Some(LineEdit {
                start: new_index,
                end: new_index,
                replacement: new[new_index..new_index + new_len].to_vec(),
            }),
            DiffOp::Replace {
                old_len,
                new_index,
                new_len,
                ..
            } => Some(LineEdit {
                start: new_index,
                end: new_index + old_len,
                replacement: new[new_index..new_index + new_len].to_vec(),
            }),
        })
        .collect()
}
