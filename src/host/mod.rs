//! Host surface boundary
//!
//! The host surface is the foreign text view being mirrored. Platform
//! integration lives outside this crate; the mirror only sees it through
//! [`HostSurface`].

pub mod memory;

pub use memory::MemorySurface;

use std::sync::Arc;

use crate::sync::{SelectionRange, TextPatch};

/// Identifier of a registered observer, used to remove it
pub type ObserverId = u64;

/// Focus transitions reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusChange {
    /// A text surface identified by `host_id` gained focus
    Gained { host_id: String },
    Lost,
}

pub type FocusHandler = Arc<dyn Fn(FocusChange) + Send + Sync>;

/// Called after the user edited the host text
pub type TextChangeHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error("Host rejected text patch {range:?}: {reason}")]
    PatchRejected {
        range: std::ops::Range<usize>,
        reason: String,
    },

    #[error("Host rejected selection: {0}")]
    SelectionRejected(String),

    #[error("Host surface unavailable")]
    Unavailable,
}

/// Operations the mirror needs from the host text surface
///
/// Handlers may be invoked from any thread; the mirror funnels them onto
/// its own task before touching shared state.
pub trait HostSurface: Send + Sync {
    fn read_current_text(&self) -> String;

    fn read_selection(&self) -> SelectionRange;

    fn apply_text_patch(&self, patch: &TextPatch) -> Result<(), HostError>;

    fn apply_selection(&self, range: SelectionRange) -> Result<(), HostError>;

    fn subscribe_to_focus_change(&self, handler: FocusHandler) -> ObserverId;

    fn subscribe_to_text_change(&self, handler: TextChangeHandler) -> ObserverId;

    fn remove_observer(&self, id: ObserverId);
}
