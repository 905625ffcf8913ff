//! Synchronization core
//!
//! - **Text**: line boundary index and host/remote coordinate conversion
//! - **Lines**: buffer line events to text patches and back
//! - **Selection**: remote cursor to host selection

pub mod lines;
pub mod selection;
pub mod text;

pub use lines::{
    LINES_EVENT, LineChangeEvent, LineEdit, LineSpan, TextPatch, patch_for_event, plan_line_edits,
};
pub use selection::{
    CURSOR_EVENT, CURSOR_EVENT_ARGS, CursorState, Mode, RemoteCursor, SelectionRange,
    adjust_selection, selection_for_cursor,
};
pub use text::{LineIndex, TextPosition, split_lines, to_byte_position};
