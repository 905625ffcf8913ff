//! Per-buffer mediator
//!
//! Ties one remote buffer to the host surface while it has focus. Holds the
//! mirrored text and the last applied changedtick; all mutation happens on
//! the coordinator's task.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::api::{NvimApi, PastePhase};
use crate::host::HostSurface;
use crate::rpc::{Buffer, Window};
use crate::session::error::MirrorError;
use crate::sync::{
    CursorState, LineChangeEvent, RemoteCursor, SelectionRange, patch_for_event, plan_line_edits,
    selection_for_cursor, split_lines, to_byte_position,
};

pub struct BufferMediator {
    api: NvimApi,
    host_id: String,
    buffer: Buffer,
    surface: Arc<dyn HostSurface>,
    text: String,
    last_tick: Option<i64>,
    cursor: Option<CursorState>,
    attached: bool,
}

impl std::fmt::Debug for BufferMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferMediator")
            .field("host_id", &self.host_id)
            .field("buffer", &self.buffer)
            .field("last_tick", &self.last_tick)
            .field("attached", &self.attached)
            .finish()
    }
}

impl BufferMediator {
    pub fn new(
        api: NvimApi,
        host_id: impl Into<String>,
        buffer: Buffer,
        surface: Arc<dyn HostSurface>,
    ) -> Self {
        Self {
            api,
            host_id: host_id.into(),
            buffer,
            surface,
            text: String::new(),
            last_tick: None,
            cursor: None,
            attached: false,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn buffer(&self) -> Buffer {
        self.buffer
    }

    /// Text as last synchronized in either direction
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn last_tick(&self) -> Option<i64> {
        self.last_tick
    }

    pub fn cursor(&self) -> Option<CursorState> {
        self.cursor
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Seed the remote buffer with `initial_text` and start receiving its
    /// line events
    pub async fn focus(&mut self, initial_text: &str) -> Result<(), MirrorError> {
        let lines = split_lines(initial_text);
        let target = to_byte_position(self.surface.read_selection().start, &lines);
        let buffer = self.buffer;
        let attach = !self.attached;

        let (attached, tick) = self
            .api
            .transaction(|api| async move {
                api.set_current_buf(buffer).await?;
                api.buf_set_lines(buffer, 0, -1, false, lines).await?;
                api.win_set_cursor(Window::CURRENT, target, true).await?;
                let attached = if attach {
                    api.buf_attach(buffer, false).await?
                } else {
                    true
                };
                let tick = api.buf_get_changedtick(buffer).await?;
                Ok::<_, MirrorError>((attached, tick))
            })
            .await?;

        if !attached {
            warn!("BufferMediator: remote refused to attach {}", buffer);
        }
        debug!(
            "BufferMediator: {} focused as {} at tick {}",
            self.host_id, buffer, tick
        );
        self.attached = attached;
        self.text = initial_text.to_string();
        self.last_tick = Some(tick);
        self.cursor = None;
        Ok(())
    }

    /// Stop receiving line events for the buffer
    pub async fn detach(&mut self) -> Result<(), MirrorError> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        match self.api.buf_detach(self.buffer).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_closed() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a remote line event to the host
    ///
    /// Returns whether the host text changed.
    pub async fn apply_remote_lines(
        &mut self,
        event: &LineChangeEvent,
    ) -> Result<bool, MirrorError> {
        if event.buffer != self.buffer {
            trace!("BufferMediator: ignoring lines of {}", event.buffer);
            return Ok(false);
        }
        if let (Some(tick), Some(last)) = (event.changedtick, self.last_tick) {
            if tick <= last {
                trace!("BufferMediator: dropping stale tick {} <= {}", tick, last);
                return Ok(false);
            }
        }

        let Some(patch) = patch_for_event(event, &self.text) else {
            return Ok(false);
        };
        self.surface.apply_text_patch(&patch)?;
        self.text = patch.apply(&self.text);
        if let Some(tick) = event.changedtick {
            self.last_tick = Some(tick);
        }
        Ok(true)
    }

    /// Show the remote cursor as a host selection
    ///
    /// `None` when the cursor belongs to another buffer or names a line the
    /// host does not have yet.
    pub async fn apply_remote_cursor(
        &mut self,
        cursor: &RemoteCursor,
    ) -> Result<Option<SelectionRange>, MirrorError> {
        if cursor.buffer != self.buffer {
            trace!("BufferMediator: ignoring cursor of {}", cursor.buffer);
            return Ok(None);
        }

        let lines = split_lines(&self.text);
        let Some(state) = cursor.to_cursor_state(&lines) else {
            debug!("BufferMediator: cursor {:?} outside mirrored text", cursor);
            return Ok(None);
        };
        self.cursor = Some(state);

        let Some(selection) = selection_for_cursor(&state, &lines) else {
            return Ok(None);
        };
        self.surface.apply_selection(selection)?;
        Ok(Some(selection))
    }

    /// Push a host edit to the remote buffer in one transaction
    ///
    /// The changedtick read at the end of the transaction becomes the last
    /// applied tick. Line events still in flight from before the push carry
    /// lower ticks and are dropped, so a remote edit racing with the push is
    /// missing from the host until a later event rewrites those lines.
    pub async fn push_host_text(&mut self, new_text: &str) -> Result<(), MirrorError> {
        let old = split_lines(&self.text);
        let new = split_lines(new_text);
        let edits = plan_line_edits(&old, &new);
        if edits.is_empty() {
            self.text = new_text.to_string();
            return Ok(());
        }

        let target = to_byte_position(self.surface.read_selection().start, &new);
        let buffer = self.buffer;
        debug!(
            "BufferMediator: pushing {} line edits to {}",
            edits.len(),
            buffer
        );

        let tick = self
            .api
            .transaction(|api| async move {
                for edit in edits {
                    api.buf_set_lines(
                        buffer,
                        edit.start as i64,
                        edit.end as i64,
                        false,
                        edit.replacement,
                    )
                    .await?;
                }
                api.win_set_cursor(Window::CURRENT, target, true).await?;
                api.buf_get_changedtick(buffer).await
            })
            .await?;

        self.text = new_text.to_string();
        self.last_tick = Some(tick);
        Ok(())
    }

    /// Forward a key; handled when the remote accepted at least one byte
    pub async fn handle_keystroke(&self, key: &str) -> Result<bool, MirrorError> {
        Ok(self.api.input(key).await? > 0)
    }

    pub async fn paste(&self, text: &str) -> Result<bool, MirrorError> {
        Ok(self.api.paste(text, false, PastePhase::Single).await?)
    }
}
