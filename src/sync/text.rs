//! Line boundary index over host text
//!
//! Host offsets count `char`s. Remote columns count UTF-8 bytes, so every
//! conversion between the two goes through the owning line's text.

use crate::api::BytePosition;

/// Position in host coordinates: 0-based line, 0-based char column
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize)]
pub struct TextPosition {
    pub line: usize,
    pub col: usize,
}

impl TextPosition {
    pub fn new(line: usize, col: usize) -> Self {
        Self { line, col }
    }
}

/// Split text into lines the way the remote buffer holds it
///
/// `""` is one empty line and a trailing newline yields a trailing empty
/// line, so `lines.join("\n")` always reproduces the input.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

/// Number of chars in `line`
pub fn char_len(line: &str) -> usize {
    line.chars().count()
}

/// Char column of byte offset `byte` in `line`, clamped to the line end
///
/// A byte offset inside a multi-byte char maps to that char.
pub fn byte_to_char_col(line: &str, byte: usize) -> usize {
    line.char_indices()
        .take_while(|(offset, _)| *offset < byte)
        .count()
        .min(char_len(line))
}

/// Byte offset of char column `col` in `line`, clamped to the line end
pub fn char_to_byte_col(line: &str, col: usize) -> usize {
    line.char_indices()
        .nth(col)
        .map_or(line.len(), |(offset, _)| offset)
}

/// Host position of a remote position, `None` when the line does not exist
pub fn to_text_position(position: BytePosition, lines: &[String]) -> Option<TextPosition> {
    let line = lines.get(position.line)?;
    Some(TextPosition::new(
        position.line,
        byte_to_char_col(line, position.byte),
    ))
}

/// Remote position of a host position; lines past the end keep their index
/// so the remote can reject them
pub fn to_byte_position(position: TextPosition, lines: &[String]) -> BytePosition {
    let byte = lines
        .get(position.line)
        .map_or(0, |line| char_to_byte_col(line, position.col));
    BytePosition::new(position.line, byte)
}

/// Char offsets of line starts, built once per text snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0];
        let mut len = 0;
        for ch in text.chars() {
            len += 1;
            if ch == '\n' {
                starts.push(len);
            }
        }
        Self { starts, len }
    }

    /// Total length in chars
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Always at least one
    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    pub fn line_start(&self, line: usize) -> Option<usize> {
        self.starts.get(line).copied()
    }

    /// Offset just before the line's newline (or the text end)
    pub fn line_end(&self, line: usize) -> Option<usize> {
        if line >= self.starts.len() {
            return None;
        }
        Some(match self.starts.get(line + 1) {
            Some(next) => next - 1,
            None => self.len,
        })
    }

    pub fn line_len(&self, line: usize) -> Option<usize> {
        Some(self.line_end(line)? - self.line_start(line)?)
    }

    /// Char offset of a position, clamping the column to the line length
    pub fn offset(&self, position: TextPosition) -> Option<usize> {
        let start = self.line_start(position.line)?;
        let len = self.line_len(position.line)?;
        Some(start + position.col.min(len))
    }

    /// Position of a char offset, clamping to the text end
    pub fn position(&self, offset: usize) -> TextPosition {
        let offset = offset.min(self.len);
        let line = match self.starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        TextPosition::new(line, offset - self.starts[line])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines_round_trips() {
        assert_eq!(split_lines(""), vec![""]);
        assert_eq!(split_lines("a\nb"), vec!["a", "b"]);
        assert_eq!(split_lines("a\n"), vec!["a", ""]);
        for text in ["", "x", "a\nb", "a\n", "\n\n"] {
            assert_eq!(split_lines(text).join("\n"), text);
        }
    }

    #[test]
    fn test_line_index_boundaries() {
        let index = LineIndex::new("ab\n\ncdé");
        assert_eq!(index.line_count(), 3);
        assert_eq!(index.len(), 7);
        assert_eq!(index.line_start(1), Some(3));
        assert_eq!(index.line_end(1), Some(3));
        assert_eq!(index.line_len(2), Some(3));
        assert_eq!(index.line_end(3), None);
    }

    #[test]
    fn test_line_index_empty_text() {
        let index = LineIndex::new("");
        assert!(index.is_empty());
        assert_eq!(index.line_count(), 1);
        assert_eq!(index.line_end(0), Some(0));
    }

    #[test]
    fn test_offset_and_position() {
        let index = LineIndex::new("héllo\nwörld\n");
        assert_eq!(index.offset(TextPosition::new(1, 2)), Some(8));
        assert_eq!(index.position(8), TextPosition::new(1, 2));
        // Column clamps to the line end
        assert_eq!(index.offset(TextPosition::new(0, 99)), Some(5));
        assert_eq!(index.position(6), TextPosition::new(1, 0));
        assert_eq!(index.position(12), TextPosition::new(2, 0));
        assert_eq!(index.offset(TextPosition::new(5, 0)), None);
    }

    #[test]
    fn test_byte_char_conversion_multibyte() {
        let line = "aé😀b";
        assert_eq!(char_to_byte_col(line, 0), 0);
        assert_eq!(char_to_byte_col(line, 2), 3);
        assert_eq!(char_to_byte_col(line, 3), 7);
        assert_eq!(char_to_byte_col(line, 10), line.len());

        assert_eq!(byte_to_char_col(line, 3), 2);
        assert_eq!(byte_to_char_col(line, 7), 3);
        assert_eq!(byte_to_char_col(line, 100), 4);
    }

    #[test]
    fn test_position_conversion() {
        let lines = split_lines("façade\nx");
        let remote = to_byte_position(TextPosition::new(0, 4), &lines);
        assert_eq!(remote, BytePosition::new(0, 5));
        assert_eq!(to_text_position(remote, &lines), Some(TextPosition::new(0, 4)));
        assert_eq!(to_text_position(BytePosition::new(5, 0), &lines), None);
        assert_eq!(
            to_byte_position(TextPosition::new(5, 3), &lines),
            BytePosition::new(5, 0)
        );
    }
}
