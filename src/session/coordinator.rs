//! Top-level mirror coordinator
//!
//! `Mirror` owns the editor process, the RPC session, the facade, the event
//! dispatcher and the state machine. It is driven from a single task: host
//! observers and remote notifications are funneled into
//! [`Mirror::next_remote_event`] and applied one at a time with
//! [`Mirror::apply_remote_event`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::NvimApi;
use crate::config::MirrorConfig;
use crate::events::{
    AutocmdInterest, EventDispatcher, NoRemoteInterest, SubscribeInterest, Subscription,
};
use crate::host::{FocusChange, HostSurface, ObserverId};
use crate::io::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, StderrMonitor,
    StopMode, Transport,
};
use crate::rpc::{Buffer, RpcSession, Value};
use crate::session::error::MirrorError;
use crate::session::mediator::BufferMediator;
use crate::session::state::{SessionAction, SessionEvent, SessionMachine, SessionState};
use crate::sync::{
    CURSOR_EVENT, CURSOR_EVENT_ARGS, CursorState, LINES_EVENT, LineChangeEvent, RemoteCursor,
    SelectionRange,
};

// ============================================================================
// Events
// ============================================================================

/// Host notification funneled onto the coordinator's task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Focus(FocusChange),
    TextChanged,
}

/// Next thing the coordinator has to apply
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    Lines(LineChangeEvent),
    Cursor(RemoteCursor),
    Host(HostEvent),
    /// The session is gone; applying this stops the mirror
    Closed,
}

/// How long a closed session waits for the editor to be reaped
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(2);

/// Bound on courtesy calls made while shutting down
const SHUTDOWN_CALL_WAIT: Duration = Duration::from_millis(500);

/// Editor feature the cursor publisher depends on (`nvim_create_autocmd`)
const REQUIRED_FEATURE: &str = "nvim-0.7";

struct ExitForwarder(mpsc::UnboundedSender<ProcessExitEvent>);

#[async_trait]
impl ProcessExitHandler for ExitForwarder {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let _ = self.0.send(event);
    }
}

// ============================================================================
// Mirror
// ============================================================================

pub struct Mirror {
    config: MirrorConfig,
    surface: Arc<dyn HostSurface>,
    process: Option<ChildProcessManager>,
    exit_events: Option<mpsc::UnboundedReceiver<ProcessExitEvent>>,
    api: Option<NvimApi>,
    dispatcher: Option<EventDispatcher>,
    machine: SessionMachine<BufferMediator>,
    buffers: HashMap<String, Buffer>,
    lines: Option<Subscription>,
    cursor: Option<Subscription>,
    host_sender: mpsc::UnboundedSender<HostEvent>,
    host_events: mpsc::UnboundedReceiver<HostEvent>,
    observers: Vec<ObserverId>,
}

impl Mirror {
    pub fn new(config: MirrorConfig, surface: Arc<dyn HostSurface>) -> Self {
        let (host_sender, host_events) = mpsc::unbounded_channel();
        Self {
            config,
            surface,
            process: None,
            exit_events: None,
            api: None,
            dispatcher: None,
            machine: SessionMachine::new(),
            buffers: HashMap::new(),
            lines: None,
            cursor: None,
            host_sender,
            host_events,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState<BufferMediator> {
        self.machine.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.machine.state(),
            SessionState::Idle | SessionState::Focused(_)
        )
    }

    pub fn api(&self) -> Option<&NvimApi> {
        self.api.as_ref()
    }

    pub fn focused(&self) -> Option<&BufferMediator> {
        self.machine.focused()
    }

    /// Last remote cursor applied to the focused buffer
    pub fn cursor_state(&self) -> Option<CursorState> {
        self.machine.focused().and_then(BufferMediator::cursor)
    }

    /// Remote buffer mirroring `host_id`, once created
    pub fn buffer_for_host(&self, host_id: &str) -> Option<Buffer> {
        self.buffers.get(host_id).copied()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the editor and connect to it over its stdio
    pub async fn start(&mut self) -> Result<(), MirrorError> {
        if !self.begin_start() {
            debug!("Mirror: start ignored in {}", self.machine.state().name());
            return Ok(());
        }

        let mut process = ChildProcessManager::new(
            self.config.nvim_path.clone(),
            self.config.command_args(),
            self.config.working_directory.clone(),
        );
        match self.config.stderr_handler.clone() {
            Some(handler) => process.on_stderr_line(move |line| handler(line)),
            None => process.on_stderr_line(|line| debug!("nvim stderr: {}", line)),
        }
        let (exit_sender, exit_events) = mpsc::unbounded_channel();
        process.on_exit(Arc::new(ExitForwarder(exit_sender)));

        let transport = match spawn_process(&mut process).await {
            Ok(transport) => transport,
            Err(e) => {
                for action in self.machine.handle(SessionEvent::Stop) {
                    self.perform(action).await;
                }
                return Err(e);
            }
        };
        self.process = Some(process);
        self.exit_events = Some(exit_events);
        self.start_with_transport(transport).await
    }

    /// Connect over an already established transport
    pub async fn start_with_transport<T: Transport>(
        &mut self,
        transport: T,
    ) -> Result<(), MirrorError> {
        if !self.begin_start() {
            debug!("Mirror: start ignored in {}", self.machine.state().name());
            return Ok(());
        }

        let session = RpcSession::new(transport);
        session.on_protocol_error(|e| warn!("Mirror: protocol error: {}", e));
        let api = NvimApi::new(session.clone()).with_timeout(self.config.request_timeout);
        let dispatcher = EventDispatcher::new(Arc::new(SubscribeInterest::new(api.clone())));
        dispatcher.attach(&session);
        self.api = Some(api.clone());
        self.dispatcher = Some(dispatcher.clone());

        if let Err(e) = self.connect(&api, &dispatcher).await {
            error!("Mirror: startup failed: {}", e);
            // An editor dying during the handshake is reported by its status
            let exit = match self.exit_events.take() {
                Some(events) if api.session().is_closed() => wait_for_exit(events).await,
                _ => None,
            };
            self.stop().await;
            return match exit {
                Some(exit) if !exit.is_expected(self.config.expected_exit_code) => {
                    Err(MirrorError::UnexpectedExit { code: exit.code })
                }
                _ => Err(e),
            };
        }

        for action in self.machine.handle(SessionEvent::Start) {
            self.perform(action).await;
        }
        Ok(())
    }

    fn begin_start(&mut self) -> bool {
        if self.machine.is_stopped() {
            return self.machine.mark_starting();
        }
        matches!(self.machine.state(), SessionState::Starting)
    }

    async fn connect(
        &mut self,
        api: &NvimApi,
        dispatcher: &EventDispatcher,
    ) -> Result<(), MirrorError> {
        let info = api.get_api_info().await?;
        info!("Mirror: connected on channel {}", info.channel_id);

        let supported = api
            .call_function("has", vec![Value::from(REQUIRED_FEATURE)])
            .await?;
        if supported.as_i64() != Some(1) {
            return Err(MirrorError::UnsupportedEditor(REQUIRED_FEATURE.to_string()));
        }

        if let Some(ui) = self.config.ui {
            api.ui_attach(ui.width, ui.height, vec![("ext_linegrid", Value::from(true))])
                .await?;
        }

        self.lines = Some(
            dispatcher
                .subscribe_with(LINES_EVENT, Arc::new(NoRemoteInterest))
                .await?,
        );
        let interest = AutocmdInterest::new(
            api.clone(),
            self.config.cursor_events.clone(),
            CURSOR_EVENT_ARGS,
        );
        self.cursor = Some(
            dispatcher
                .subscribe_with(CURSOR_EVENT, Arc::new(interest))
                .await?,
        );
        Ok(())
    }

    /// Detach the focused buffer, then tear everything down
    pub async fn stop(&mut self) {
        if let Some(mediator) = self.machine.focused_mut() {
            if let Err(e) = mediator.detach().await {
                warn!("Mirror: detach on stop failed: {}", e);
            }
        }
        for action in self.machine.handle(SessionEvent::Stop) {
            self.perform(action).await;
        }
    }

    async fn perform(&mut self, action: SessionAction) {
        match action {
            SessionAction::PerformStartup => self.attach_observers(),
            SessionAction::PerformShutdown => self.shutdown().await,
        }
    }

    fn attach_observers(&mut self) {
        let sender = self.host_sender.clone();
        let focus = self
            .surface
            .subscribe_to_focus_change(Arc::new(move |change: FocusChange| {
                let _ = sender.send(HostEvent::Focus(change));
            }));
        let sender = self.host_sender.clone();
        let text = self.surface.subscribe_to_text_change(Arc::new(move || {
            let _ = sender.send(HostEvent::TextChanged);
        }));
        self.observers = vec![focus, text];
    }

    async fn shutdown(&mut self) {
        for id in self.observers.drain(..) {
            self.surface.remove_observer(id);
        }
        while self.host_events.try_recv().is_ok() {}

        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.clear();
        }
        self.lines = None;
        self.cursor = None;

        if let Some(api) = self.api.take() {
            if self.config.ui.is_some() {
                match tokio::time::timeout(SHUTDOWN_CALL_WAIT, api.ui_detach()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Mirror: ui detach failed: {}", e),
                    Err(_) => debug!("Mirror: ui detach timed out"),
                }
            }
            if let Err(e) = api.quit().await {
                debug!("Mirror: quit not sent: {}", e);
            }
            api.session().close().await;
        }
        if let Some(mut process) = self.process.take() {
            if process.is_running() {
                if let Err(e) = process.stop(StopMode::Graceful).await {
                    warn!("Mirror: failed to stop editor: {}", e);
                }
            }
        }
        self.exit_events = None;
        self.buffers.clear();
        info!("Mirror: shut down");
    }

    // ========================================================================
    // Host-facing operations
    // ========================================================================

    /// Mirror the host surface `host_id` into its remote buffer
    pub async fn focus(&mut self, host_id: &str, initial_text: &str) -> Result<(), MirrorError> {
        if !self.is_running() {
            return Err(MirrorError::NotRunning);
        }
        let api = self.api.clone().ok_or(MirrorError::NotRunning)?;

        if let Some(previous) = self.machine.focused_mut() {
            if let Err(e) = previous.detach().await {
                warn!("Mirror: detaching {} failed: {}", previous.host_id(), e);
            }
        }

        let result = async {
            let buffer = self.buffer_for(&api, host_id).await?;
            let mut mediator =
                BufferMediator::new(api, host_id, buffer, Arc::clone(&self.surface));
            mediator.focus(initial_text).await?;
            Ok::<_, MirrorError>(mediator)
        }
        .await;

        match result {
            Ok(mediator) => {
                self.machine.handle(SessionEvent::Focus(mediator));
                Ok(())
            }
            Err(e) => {
                self.machine.handle(SessionEvent::Unfocus);
                Err(e)
            }
        }
    }

    async fn buffer_for(&mut self, api: &NvimApi, host_id: &str) -> Result<Buffer, MirrorError> {
        if let Some(buffer) = self.buffers.get(host_id) {
            return Ok(*buffer);
        }

        let name = host_id.to_string();
        let buffer = api
            .transaction(|api| async move {
                let buffer = api.create_buf(true, false).await?;
                api.buf_set_name(buffer, &name).await?;
                Ok::<_, MirrorError>(buffer)
            })
            .await?;
        debug!("Mirror: {} mirrors {}", buffer, host_id);
        self.buffers.insert(host_id.to_string(), buffer);
        Ok(buffer)
    }

    pub async fn unfocus(&mut self) -> Result<(), MirrorError> {
        let detached = match self.machine.focused_mut() {
            Some(mediator) => mediator.detach().await,
            None => return Ok(()),
        };
        self.machine.handle(SessionEvent::Unfocus);
        detached
    }

    /// Forward a key to the focused buffer
    ///
    /// Unfocused keys are not handled.
    pub async fn handle_keystroke(&self, key: &str) -> Result<bool, MirrorError> {
        match self.machine.focused() {
            Some(mediator) => mediator.handle_keystroke(key).await,
            None => Ok(false),
        }
    }

    pub async fn paste(&self, text: &str) -> Result<bool, MirrorError> {
        match self.machine.focused() {
            Some(mediator) => mediator.paste(text).await,
            None => Ok(false),
        }
    }

    /// Push the current host text to the focused buffer
    pub async fn host_text_changed(&mut self) -> Result<(), MirrorError> {
        let text = self.surface.read_current_text();
        match self.machine.focused_mut() {
            Some(mediator) => mediator.push_host_text(&text).await,
            None => Ok(()),
        }
    }

    // ========================================================================
    // Remote-facing operations
    // ========================================================================

    pub async fn on_remote_text_changed(
        &mut self,
        event: &LineChangeEvent,
    ) -> Result<bool, MirrorError> {
        match self.machine.focused_mut() {
            Some(mediator) => mediator.apply_remote_lines(event).await,
            None => Ok(false),
        }
    }

    pub async fn on_remote_cursor_changed(
        &mut self,
        cursor: &RemoteCursor,
    ) -> Result<Option<SelectionRange>, MirrorError> {
        match self.machine.focused_mut() {
            Some(mediator) => mediator.apply_remote_cursor(cursor).await,
            None => Ok(None),
        }
    }

    /// Wait for the next remote notification, host event or session closure
    ///
    /// Line events win over cursor events when both are ready, so a cursor
    /// is mapped against text that already has the preceding edits.
    /// Malformed notifications are logged and skipped.
    pub async fn next_remote_event(&mut self) -> MirrorEvent {
        let Some(session) = self.api.as_ref().map(|api| api.session().clone()) else {
            return MirrorEvent::Closed;
        };
        let Self {
            lines,
            cursor,
            host_events,
            ..
        } = self;

        loop {
            tokio::select! {
                biased;
                Some(params) = next_params(lines) => match LineChangeEvent::from_params(&params) {
                    Ok(event) => return MirrorEvent::Lines(event),
                    Err(e) => warn!("Mirror: skipping malformed line event: {}", e),
                },
                Some(params) = next_params(cursor) => match RemoteCursor::from_params(&params) {
                    Ok(cursor) => return MirrorEvent::Cursor(cursor),
                    Err(e) => warn!("Mirror: skipping malformed cursor event: {}", e),
                },
                Some(event) = host_events.recv() => return MirrorEvent::Host(event),
                _ = session.closed() => return MirrorEvent::Closed,
            }
        }
    }

    pub async fn apply_remote_event(&mut self, event: MirrorEvent) -> Result<(), MirrorError> {
        match event {
            MirrorEvent::Lines(event) => self.on_remote_text_changed(&event).await.map(drop),
            MirrorEvent::Cursor(cursor) => self.on_remote_cursor_changed(&cursor).await.map(drop),
            MirrorEvent::Host(HostEvent::TextChanged) => self.host_text_changed().await,
            MirrorEvent::Host(HostEvent::Focus(FocusChange::Gained { host_id })) => {
                let text = self.surface.read_current_text();
                self.focus(&host_id, &text).await
            }
            MirrorEvent::Host(HostEvent::Focus(FocusChange::Lost)) => self.unfocus().await,
            MirrorEvent::Closed => self.session_closed().await,
        }
    }

    /// Apply events until none arrives for `quiet`
    ///
    /// Returns the number of events applied. Stops early once the session
    /// has closed.
    pub async fn pump(&mut self, quiet: Duration) -> Result<usize, MirrorError> {
        let mut applied = 0;
        while self.is_running() {
            let event = match tokio::time::timeout(quiet, self.next_remote_event()).await {
                Ok(event) => event,
                Err(_) => break,
            };
            let closed = event == MirrorEvent::Closed;
            self.apply_remote_event(event).await?;
            applied += 1;
            if closed {
                break;
            }
        }
        Ok(applied)
    }

    async fn session_closed(&mut self) -> Result<(), MirrorError> {
        if self.machine.is_stopped() {
            return Ok(());
        }
        warn!("Mirror: session closed by the remote");

        // Stdout closes before the process is reaped, so wait for the status
        // before the shutdown signals the process
        let exit = match self.exit_events.take() {
            Some(events) => Some(wait_for_exit(events).await),
            None => None,
        };
        for action in self.machine.handle(SessionEvent::Stop) {
            self.perform(action).await;
        }

        match exit {
            // Connected over a bare transport; there is no status to check
            None => Ok(()),
            Some(Some(exit)) if exit.is_expected(self.config.expected_exit_code) => {
                info!("Mirror: editor exited with expected status {:?}", exit.code);
                Ok(())
            }
            Some(Some(exit)) => Err(MirrorError::UnexpectedExit { code: exit.code }),
            Some(None) => Err(MirrorError::UnexpectedExit { code: None }),
        }
    }
}

/// Exit event of the editor, or `None` if it is not reaped in time
async fn wait_for_exit(
    mut events: mpsc::UnboundedReceiver<ProcessExitEvent>,
) -> Option<ProcessExitEvent> {
    match tokio::time::timeout(EXIT_STATUS_WAIT, events.recv()).await {
        Ok(exit) => exit,
        Err(_) => {
            warn!(
                "Mirror: editor still running {:?} after closing its channel",
                EXIT_STATUS_WAIT
            );
            None
        }
    }
}

async fn spawn_process(
    process: &mut ChildProcessManager,
) -> Result<crate::io::StdioTransport, MirrorError> {
    process.start().await?;
    Ok(process.create_stdio_transport()?)
}

async fn next_params(subscription: &mut Option<Subscription>) -> Option<Vec<Value>> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
