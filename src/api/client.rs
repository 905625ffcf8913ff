//! Typed API facade over the RPC session
//!
//! One method per remote operation the mirror needs. Each method builds the
//! positional argument list, goes through [`NvimApi::call`] and unpacks the
//! raw result into the expected shape.
//!
//! All calls on one facade (and its clones) share a single async lock.
//! [`NvimApi::transaction`] holds that lock for a whole sequence of calls and
//! hands the sequence a child facade that skips locking, so no other caller's
//! request lands on the wire in between.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{Level, debug, trace};

use crate::api::error::ApiError;
use crate::api::types::{ApiInfo, AutocmdOptions, BytePosition, ModeInfo, PastePhase};
use crate::log_timing;
use crate::rpc::{Buffer, RpcSession, Value, Window};

#[derive(Clone)]
pub struct NvimApi {
    session: RpcSession,
    lock: Arc<tokio::sync::Mutex<()>>,
    holds_lock: bool,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for NvimApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvimApi")
            .field("session", &self.session)
            .field("holds_lock", &self.holds_lock)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl NvimApi {
    pub fn new(session: RpcSession) -> Self {
        Self {
            session,
            lock: Arc::new(tokio::sync::Mutex::new(())),
            holds_lock: false,
            timeout: None,
        }
    }

    /// Fail calls that take longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &RpcSession {
        &self.session
    }

    /// Whether this facade runs inside a transaction
    pub fn in_transaction(&self) -> bool {
        self.holds_lock
    }

    /// Issue a raw call, taking the facade lock unless a transaction holds it
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        let _guard = if self.holds_lock {
            None
        } else {
            Some(self.lock.lock().await)
        };
        self.send(method, args).await
    }

    async fn send(&self, method: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        let result = match self.timeout {
            Some(timeout) => {
                self.session
                    .request_with_timeout(method, args, timeout)
                    .await
            }
            None => self.session.request(method, args).await,
        };
        result.map_err(ApiError::from)
    }

    /// Run `body` with exclusive use of the connection
    ///
    /// The lock is released when the returned future completes or is
    /// dropped, whatever the outcome of `body`. Calling `transaction` on the
    /// child facade runs the nested body directly.
    pub async fn transaction<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(NvimApi) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.holds_lock {
            trace!("NvimApi: nested transaction, lock already held");
            return body(self.clone()).await;
        }

        let started = Instant::now();
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        let child = NvimApi {
            holds_lock: true,
            ..self.clone()
        };

        let result = body(child).await;
        log_timing!(Level::DEBUG, "transaction", started.elapsed());
        result
    }

    // ========================================================================
    // Global
    // ========================================================================

    pub async fn get_api_info(&self) -> Result<ApiInfo, ApiError> {
        const METHOD: &str = "nvim_get_api_info";
        let value = self.call(METHOD, vec![]).await?;
        match value.as_array() {
            Some([channel, metadata]) => match channel.as_i64() {
                Some(channel_id) => Ok(ApiInfo {
                    channel_id,
                    metadata: metadata.clone(),
                }),
                None => Err(ApiError::unexpected(METHOD, "[channel, metadata]", &value)),
            },
            _ => Err(ApiError::unexpected(METHOD, "[channel, metadata]", &value)),
        }
    }

    pub async fn get_mode(&self) -> Result<ModeInfo, ApiError> {
        const METHOD: &str = "nvim_get_mode";
        let value = self.call(METHOD, vec![]).await?;
        ModeInfo::from_value(&value).ok_or_else(|| ApiError::unexpected(METHOD, "mode map", &value))
    }

    /// Ask the editor to exit; sent as a notification since no answer
    /// would come back
    pub async fn quit(&self) -> Result<(), ApiError> {
        self.session
            .notify("nvim_command", vec![Value::from("qall!")])
            .await
            .map_err(ApiError::from)
    }

    /// Execute an Ex command
    pub async fn command(&self, command: &str) -> Result<(), ApiError> {
        self.call("nvim_command", vec![Value::from(command)])
            .await
            .map(drop)
    }

    /// Evaluate a Vimscript expression
    pub async fn eval(&self, expression: &str) -> Result<Value, ApiError> {
        self.call("nvim_eval", vec![Value::from(expression)]).await
    }

    pub async fn exec_lua(&self, code: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        self.call("nvim_exec_lua", vec![Value::from(code), Value::Array(args)])
            .await
    }

    pub async fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        self.call("nvim_call_function", vec![Value::from(name), Value::Array(args)])
            .await
    }

    /// Queue raw keys for input; returns the number of bytes accepted
    pub async fn input(&self, keys: &str) -> Result<usize, ApiError> {
        const METHOD: &str = "nvim_input";
        let value = self.call(METHOD, vec![Value::from(keys)]).await?;
        match value.as_i64() {
            Some(written) if written >= 0 => Ok(written as usize),
            _ => Err(ApiError::unexpected(METHOD, "byte count", &value)),
        }
    }

    /// Paste text as if typed in a terminal bracketed paste
    ///
    /// Returns false when the paste was cancelled by the remote.
    pub async fn paste(&self, data: &str, crlf: bool, phase: PastePhase) -> Result<bool, ApiError> {
        const METHOD: &str = "nvim_paste";
        let value = self
            .call(
                METHOD,
                vec![
                    Value::from(data),
                    Value::from(crlf),
                    Value::from(phase.code()),
                ],
            )
            .await?;
        value
            .as_bool()
            .ok_or_else(|| ApiError::unexpected(METHOD, "boolean", &value))
    }

    pub async fn subscribe(&self, event: &str) -> Result<(), ApiError> {
        self.call("nvim_subscribe", vec![Value::from(event)])
            .await
            .map(drop)
    }

    pub async fn unsubscribe(&self, event: &str) -> Result<(), ApiError> {
        self.call("nvim_unsubscribe", vec![Value::from(event)])
            .await
            .map(drop)
    }

    /// Register an autocmd; returns its id
    pub async fn create_autocmd(
        &self,
        events: &[String],
        options: &AutocmdOptions,
    ) -> Result<i64, ApiError> {
        const METHOD: &str = "nvim_create_autocmd";
        let events = Value::Array(events.iter().map(|e| Value::from(e.as_str())).collect());
        let value = self.call(METHOD, vec![events, options.to_value()]).await?;
        value
            .as_i64()
            .ok_or_else(|| ApiError::unexpected(METHOD, "autocmd id", &value))
    }

    pub async fn del_autocmd(&self, id: i64) -> Result<(), ApiError> {
        self.call("nvim_del_autocmd", vec![Value::from(id)])
            .await
            .map(drop)
    }

    /// Attach as an external UI; required before some input paths behave
    /// like an interactive session
    pub async fn ui_attach(
        &self,
        width: u32,
        height: u32,
        options: Vec<(&str, Value)>,
    ) -> Result<(), ApiError> {
        self.call(
            "nvim_ui_attach",
            vec![
                Value::from(i64::from(width)),
                Value::from(i64::from(height)),
                Value::map(options),
            ],
        )
        .await
        .map(drop)
    }

    pub async fn ui_detach(&self) -> Result<(), ApiError> {
        self.call("nvim_ui_detach", vec![]).await.map(drop)
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    pub async fn get_current_buf(&self) -> Result<Buffer, ApiError> {
        const METHOD: &str = "nvim_get_current_buf";
        let value = self.call(METHOD, vec![]).await?;
        value
            .as_buffer()
            .ok_or_else(|| ApiError::unexpected(METHOD, "buffer", &value))
    }

    pub async fn set_current_buf(&self, buffer: Buffer) -> Result<(), ApiError> {
        self.call("nvim_set_current_buf", vec![Value::from(buffer)])
            .await
            .map(drop)
    }

    /// Create a buffer; a non-positive handle from the remote is an error
    pub async fn create_buf(&self, listed: bool, scratch: bool) -> Result<Buffer, ApiError> {
        const METHOD: &str = "nvim_create_buf";
        let value = self
            .call(METHOD, vec![Value::from(listed), Value::from(scratch)])
            .await?;
        let buffer = value
            .as_buffer()
            .ok_or_else(|| ApiError::unexpected(METHOD, "buffer", &value))?;
        if !buffer.is_valid() {
            return Err(ApiError::BufferCreationFailed(buffer.id()));
        }
        debug!("NvimApi: created {}", buffer);
        Ok(buffer)
    }

    pub async fn buf_set_name(&self, buffer: Buffer, name: &str) -> Result<(), ApiError> {
        self.call(
            "nvim_buf_set_name",
            vec![Value::from(buffer), Value::from(name)],
        )
        .await
        .map(drop)
    }

    pub async fn buf_get_name(&self, buffer: Buffer) -> Result<String, ApiError> {
        const METHOD: &str = "nvim_buf_get_name";
        match self.call(METHOD, vec![Value::from(buffer)]).await? {
            Value::String(name) => Ok(name),
            other => Err(ApiError::unexpected(METHOD, "string", &other)),
        }
    }

    pub async fn buf_line_count(&self, buffer: Buffer) -> Result<usize, ApiError> {
        const METHOD: &str = "nvim_buf_line_count";
        let value = self.call(METHOD, vec![Value::from(buffer)]).await?;
        match value.as_i64() {
            Some(count) if count >= 0 => Ok(count as usize),
            _ => Err(ApiError::unexpected(METHOD, "line count", &value)),
        }
    }

    pub async fn buf_get_changedtick(&self, buffer: Buffer) -> Result<i64, ApiError> {
        const METHOD: &str = "nvim_buf_get_changedtick";
        let value = self.call(METHOD, vec![Value::from(buffer)]).await?;
        value
            .as_i64()
            .ok_or_else(|| ApiError::unexpected(METHOD, "integer", &value))
    }

    /// Lines `[start, end)`; negative indices count from the end, `-1`
    /// meaning one past the last line
    pub async fn buf_get_lines(
        &self,
        buffer: Buffer,
        start: i64,
        end: i64,
        strict: bool,
    ) -> Result<Vec<String>, ApiError> {
        const METHOD: &str = "nvim_buf_get_lines";
        let value = self
            .call(
                METHOD,
                vec![
                    Value::from(buffer),
                    Value::from(start),
                    Value::from(end),
                    Value::from(strict),
                ],
            )
            .await?;
        let lines = value
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|line| line.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| ApiError::unexpected(METHOD, "list of strings", &value))?;
        Ok(lines)
    }

    /// Replace lines `[start, end)`; an empty replacement deletes the range
    pub async fn buf_set_lines(
        &self,
        buffer: Buffer,
        start: i64,
        end: i64,
        strict: bool,
        replacement: Vec<String>,
    ) -> Result<(), ApiError> {
        self.call(
            "nvim_buf_set_lines",
            vec![
                Value::from(buffer),
                Value::from(start),
                Value::from(end),
                Value::from(strict),
                Value::from(replacement),
            ],
        )
        .await
        .map(drop)
    }

    /// Start receiving `nvim_buf_lines_event` notifications for `buffer`
    pub async fn buf_attach(&self, buffer: Buffer, send_buffer: bool) -> Result<bool, ApiError> {
        const METHOD: &str = "nvim_buf_attach";
        let value = self
            .call(
                METHOD,
                vec![
                    Value::from(buffer),
                    Value::from(send_buffer),
                    Value::empty_map(),
                ],
            )
            .await?;
        value
            .as_bool()
            .ok_or_else(|| ApiError::unexpected(METHOD, "boolean", &value))
    }

    pub async fn buf_detach(&self, buffer: Buffer) -> Result<bool, ApiError> {
        const METHOD: &str = "nvim_buf_detach";
        let value = self.call(METHOD, vec![Value::from(buffer)]).await?;
        value
            .as_bool()
            .ok_or_else(|| ApiError::unexpected(METHOD, "boolean", &value))
    }

    // ========================================================================
    // Windows
    // ========================================================================

    pub async fn get_current_win(&self) -> Result<Window, ApiError> {
        const METHOD: &str = "nvim_get_current_win";
        let value = self.call(METHOD, vec![]).await?;
        value
            .as_window()
            .ok_or_else(|| ApiError::unexpected(METHOD, "window", &value))
    }

    pub async fn win_get_cursor(&self, window: Window) -> Result<BytePosition, ApiError> {
        const METHOD: &str = "nvim_win_get_cursor";
        let value = self.call(METHOD, vec![Value::from(window)]).await?;
        BytePosition::from_wire(&value)
            .ok_or_else(|| ApiError::unexpected(METHOD, "[row, col]", &value))
    }

    /// Move the cursor of `window`
    ///
    /// With `tolerate_out_of_range`, a validation failure (target line not
    /// in the buffer yet) is swallowed and reported as `Ok(false)`.
    pub async fn win_set_cursor(
        &self,
        window: Window,
        position: BytePosition,
        tolerate_out_of_range: bool,
    ) -> Result<bool, ApiError> {
        let result = self
            .call(
                "nvim_win_set_cursor",
                vec![Value::from(window), position.to_wire()],
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if tolerate_out_of_range && e.is_validation() => {
                debug!(
                    "NvimApi: ignoring out-of-range cursor target {:?}: {}",
                    position, e
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
