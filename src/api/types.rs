//! Typed arguments and results of remote API calls

use crate::rpc::Value;

/// Position inside a remote buffer, 0-based line and 0-based byte column
///
/// The remote reports lines 1-based on the wire; the facade converts at the
/// boundary so nothing above it sees 1-based lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize)]
pub struct BytePosition {
    pub line: usize,
    pub byte: usize,
}

impl BytePosition {
    pub fn new(line: usize, byte: usize) -> Self {
        Self { line, byte }
    }

    /// Parse a `[row, col]` pair with a 1-based row
    pub(crate) fn from_wire(value: &Value) -> Option<Self> {
        match value.as_array()? {
            [row, col] => {
                let row = row.as_i64()?;
                let col = col.as_i64()?;
                if row < 1 || col < 0 {
                    return None;
                }
                Some(Self::new(row as usize - 1, col as usize))
            }
            _ => None,
        }
    }

    pub(crate) fn to_wire(self) -> Value {
        Value::Array(vec![
            Value::from(self.line + 1),
            Value::from(self.byte),
        ])
    }
}

/// Result of `nvim_get_api_info`
#[derive(Debug, Clone, PartialEq)]
pub struct ApiInfo {
    /// Channel id assigned to this client
    pub channel_id: i64,
    /// Raw API metadata
    pub metadata: Value,
}

/// Result of `nvim_get_mode`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    /// Short mode name as returned by `mode(1)`
    pub mode: String,
    /// Whether the editor is waiting for input mid-mapping
    pub blocking: bool,
}

impl ModeInfo {
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        let mode = value.get("mode")?.as_str()?.to_string();
        let blocking = value
            .get("blocking")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self { mode, blocking })
    }
}

/// Options for `nvim_create_autocmd`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutocmdOptions {
    /// Ex command run when the autocmd fires
    pub command: Option<String>,
    pub pattern: Option<String>,
    pub group: Option<String>,
    pub desc: Option<String>,
    pub once: bool,
}

impl AutocmdOptions {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut entries: Vec<(&str, Value)> = Vec::new();
        if let Some(command) = &self.command {
            entries.push(("command", Value::from(command.as_str())));
        }
        if let Some(pattern) = &self.pattern {
            entries.push(("pattern", Value::from(pattern.as_str())));
        }
        if let Some(group) = &self.group {
            entries.push(("group", Value::from(group.as_str())));
        }
        if let Some(desc) = &self.desc {
            entries.push(("desc", Value::from(desc.as_str())));
        }
        if self.once {
            entries.push(("once", Value::from(true)));
        }
        Value::map(entries)
    }
}

/// Phase argument of `nvim_paste`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PastePhase {
    /// Whole paste in one call
    Single,
    Start,
    Continue,
    End,
}

impl PastePhase {
    pub(crate) fn code(self) -> i64 {
        match self {
            PastePhase::Single => -1,
            PastePhase::Start => 1,
            PastePhase::Continue => 2,
            PastePhase::End => 3,
        }
    }
}
