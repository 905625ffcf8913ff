//! In-memory host surface
//!
//! Holds text and selection in a mutex. User actions are simulated with
//! [`MemorySurface::user_edit`], [`MemorySurface::gain_focus`] and
//! [`MemorySurface::lose_focus`], which notify observers the way a real
//! platform surface would. Patches applied by the mirror do not notify.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::host::{
    FocusChange, FocusHandler, HostError, HostSurface, ObserverId, TextChangeHandler,
};
use crate::sync::{LineIndex, SelectionRange, TextPatch};

#[derive(Default)]
struct SurfaceState {
    text: String,
    selection: SelectionRange,
    focus_observers: Vec<(ObserverId, FocusHandler)>,
    text_observers: Vec<(ObserverId, TextChangeHandler)>,
}

#[derive(Default)]
pub struct MemorySurface {
    state: Mutex<SurfaceState>,
    next_observer: AtomicU64,
}

impl std::fmt::Debug for MemorySurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("MemorySurface")
            .field("text", &state.text)
            .field("selection", &state.selection)
            .finish()
    }
}

impl MemorySurface {
    pub fn new(text: impl Into<String>) -> Self {
        let surface = Self::default();
        surface.state.lock().unwrap().text = text.into();
        surface
    }

    pub fn text(&self) -> String {
        self.state.lock().unwrap().text.clone()
    }

    pub fn selection(&self) -> SelectionRange {
        self.state.lock().unwrap().selection
    }

    /// Replace the text as the user would and notify text observers
    pub fn user_edit(&self, text: impl Into<String>, selection: SelectionRange) {
        let observers: Vec<TextChangeHandler> = {
            let mut state = self.state.lock().unwrap();
            state.text = text.into();
            state.selection = selection;
            state.text_observers.iter().map(|(_, h)| h.clone()).collect()
        };
        for observer in observers {
            observer();
        }
    }

    pub fn gain_focus(&self, host_id: &str) {
        self.notify_focus(FocusChange::Gained {
            host_id: host_id.to_string(),
        });
    }

    pub fn lose_focus(&self) {
        self.notify_focus(FocusChange::Lost);
    }

    /// Number of registered observers of either kind
    pub fn observer_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.focus_observers.len() + state.text_observers.len()
    }

    fn notify_focus(&self, change: FocusChange) {
        let observers: Vec<FocusHandler> = {
            let state = self.state.lock().unwrap();
            state.focus_observers.iter().map(|(_, h)| h.clone()).collect()
        };
        for observer in observers {
            observer(change.clone());
        }
    }

    fn next_id(&self) -> ObserverId {
        self.next_observer.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl HostSurface for MemorySurface {
    fn read_current_text(&self) -> String {
        self.text()
    }

    fn read_selection(&self) -> SelectionRange {
        self.selection()
    }

    fn apply_text_patch(&self, patch: &TextPatch) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        let len = LineIndex::new(&state.text).len();
        if patch.range.start > patch.range.end || patch.range.end > len {
            return Err(HostError::PatchRejected {
                range: patch.range.clone(),
                reason: format!("text has {len} chars"),
            });
        }
        trace!("MemorySurface: applying {:?}", patch);
        state.text = patch.apply(&state.text);
        Ok(())
    }

    fn apply_selection(&self, range: SelectionRange) -> Result<(), HostError> {
        self.state.lock().unwrap().selection = range;
        Ok(())
    }

    fn subscribe_to_focus_change(&self, handler: FocusHandler) -> ObserverId {
        let id = self.next_id();
        self.state
            .lock()
            .unwrap()
            .focus_observers
            .push((id, handler));
        id
    }

    fn subscribe_to_text_change(&self, handler: TextChangeHandler) -> ObserverId {
        let id = self.next_id();
        self.state.lock().unwrap().text_observers.push((id, handler));
        id
    }

    fn remove_observer(&self, id: ObserverId) {
        let mut state = self.state.lock().unwrap();
        state.focus_observers.retain(|(observer, _)| *observer != id);
        state.text_observers.retain(|(observer, _)| *observer != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_apply_patch_and_selection() {
        let surface = MemorySurface::new("hello world");
        surface
            .apply_text_patch(&TextPatch {
                range: 6..11,
                replacement: "there".to_string(),
            })
            .unwrap();
        assert_eq!(surface.text(), "hello there");

        let selection = SelectionRange::on_line(0, 1, 2);
        surface.apply_selection(selection).unwrap();
        assert_eq!(surface.read_selection(), selection);
    }

    #[test]
    fn test_out_of_range_patch_rejected() {
        let surface = MemorySurface::new("abc");
        let result = surface.apply_text_patch(&TextPatch {
            range: 2..9,
            replacement: String::new(),
        });
        assert!(matches!(result, Err(HostError::PatchRejected { .. })));
        assert_eq!(surface.text(), "abc");
    }

    #[test]
    fn test_observers_notified_and_removed() {
        let surface = MemorySurface::new("");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let focus_seen = Arc::clone(&seen);
        let focus_id = surface.subscribe_to_focus_change(Arc::new(move |change: FocusChange| {
            focus_seen.lock().unwrap().push(format!("{change:?}"));
        }));
        let text_seen = Arc::clone(&seen);
        let text_id = surface.subscribe_to_text_change(Arc::new(move || {
            text_seen.lock().unwrap().push("text".to_string());
        }));
        assert_eq!(surface.observer_count(), 2);

        surface.gain_focus("notes");
        surface.user_edit("typed", SelectionRange::on_line(0, 5, 5));
        surface.lose_focus();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "Gained { host_id: \"notes\" }".to_string(),
                "text".to_string(),
                "Lost".to_string()
            ]
        );

        surface.remove_observer(focus_id);
        surface.remove_observer(text_id);
        assert_eq!(surface.observer_count(), 0);
    }

    #[test]
    fn test_mirror_patches_do_not_notify() {
        let surface = MemorySurface::new("a");
        let notified = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&notified);
        surface.subscribe_to_text_change(Arc::new(move || *counter.lock().unwrap() += 1));

        surface
            .apply_text_patch(&TextPatch {
                range: 1..1,
                replacement: "b".to_string(),
            })
            .unwrap();
        assert_eq!(*notified.lock().unwrap(), 0);
    }
}
