//! Session state machine
//!
//! Pure transition table: events go in, actions come out. The coordinator
//! performs the actions. Pairs not listed in [`SessionMachine::handle`] are
//! ignored.

use tracing::{debug, info};

/// Lifecycle states; `M` is the per-buffer mediator held while focused
#[derive(Debug)]
pub enum SessionState<M> {
    Stopped,
    Starting,
    Idle,
    Focused(M),
}

impl<M> SessionState<M> {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Idle => "idle",
            SessionState::Focused(_) => "focused",
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent<M> {
    Start,
    Stop,
    Focus(M),
    Unfocus,
}

impl<M> SessionEvent<M> {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::Stop => "stop",
            SessionEvent::Focus(_) => "focus",
            SessionEvent::Unfocus => "unfocus",
        }
    }
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Attach host observers
    PerformStartup,
    /// Detach observers and clear subscriptions
    PerformShutdown,
}

#[derive(Debug)]
pub struct SessionMachine<M> {
    state: SessionState<M>,
}

impl<M> Default for SessionMachine<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> SessionMachine<M> {
    pub fn new() -> Self {
        Self {
            state: SessionState::Stopped,
        }
    }

    pub fn state(&self) -> &SessionState<M> {
        &self.state
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, SessionState::Stopped)
    }

    /// Mediator of the focused buffer
    pub fn focused(&self) -> Option<&M> {
        match &self.state {
            SessionState::Focused(mediator) => Some(mediator),
            _ => None,
        }
    }

    pub fn focused_mut(&mut self) -> Option<&mut M> {
        match &mut self.state {
            SessionState::Focused(mediator) => Some(mediator),
            _ => None,
        }
    }

    /// Record that startup is in progress; only valid from `stopped`
    pub fn mark_starting(&mut self) -> bool {
        if !self.is_stopped() {
            return false;
        }
        debug!("SessionMachine: stopped -> starting");
        self.state = SessionState::Starting;
        true
    }

    /// Apply `event` and return the actions the caller must perform
    pub fn handle(&mut self, event: SessionEvent<M>) -> Vec<SessionAction> {
        let from = self.state.name();
        let event_name = event.name();
        let previous = std::mem::replace(&mut self.state, SessionState::Stopped);

        let (next, actions) = match (previous, event) {
            (SessionState::Stopped | SessionState::Starting, SessionEvent::Start) => {
                (SessionState::Idle, vec![SessionAction::PerformStartup])
            }
            (SessionState::Idle | SessionState::Focused(_), SessionEvent::Focus(mediator)) => {
                (SessionState::Focused(mediator), Vec::new())
            }
            (SessionState::Focused(_), SessionEvent::Unfocus) => (SessionState::Idle, Vec::new()),
            (_, SessionEvent::Stop) => (SessionState::Stopped, vec![SessionAction::PerformShutdown]),
            (state, _) => {
                debug!("SessionMachine: ignoring {} in {}", event_name, from);
                self.state = state;
                return Vec::new();
            }
        };

        info!(
            from,
            event = event_name,
            to = next.name(),
            actions = ?actions,
            "Session transition"
        );
        self.state = next;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in_idle() -> SessionMachine<&'static str> {
        let mut machine = SessionMachine::new();
        machine.handle(SessionEvent::Start);
        machine
    }

    #[test]
    fn test_start_performs_startup() {
        let mut machine: SessionMachine<&str> = SessionMachine::new();
        assert_eq!(machine.state().name(), "stopped");

        let actions = machine.handle(SessionEvent::Start);
        assert_eq!(actions, vec![SessionAction::PerformStartup]);
        assert_eq!(machine.state().name(), "idle");
    }

    #[test]
    fn test_start_from_starting() {
        let mut machine: SessionMachine<&str> = SessionMachine::new();
        assert!(machine.mark_starting());
        assert!(!machine.mark_starting());
        assert_eq!(machine.state().name(), "starting");

        let actions = machine.handle(SessionEvent::Start);
        assert_eq!(actions, vec![SessionAction::PerformStartup]);
        assert_eq!(machine.state().name(), "idle");
    }

    #[test]
    fn test_focus_swaps_mediator() {
        let mut machine = machine_in_idle();

        assert!(machine.handle(SessionEvent::Focus("first")).is_empty());
        assert_eq!(machine.focused(), Some(&"first"));

        assert!(machine.handle(SessionEvent::Focus("second")).is_empty());
        assert_eq!(machine.focused(), Some(&"second"));

        machine.handle(SessionEvent::Unfocus);
        assert_eq!(machine.state().name(), "idle");
        assert_eq!(machine.focused(), None);
    }

    #[test]
    fn test_stop_from_any_state() {
        let mut stopped: SessionMachine<&str> = SessionMachine::new();
        assert_eq!(
            stopped.handle(SessionEvent::Stop),
            vec![SessionAction::PerformShutdown]
        );

        let mut focused = machine_in_idle();
        focused.handle(SessionEvent::Focus("buffer"));
        assert_eq!(
            focused.handle(SessionEvent::Stop),
            vec![SessionAction::PerformShutdown]
        );
        assert!(focused.is_stopped());
        assert_eq!(focused.focused(), None);
    }

    #[test]
    fn test_ignored_pairs() {
        let mut machine: SessionMachine<&str> = SessionMachine::new();
        assert!(machine.handle(SessionEvent::Unfocus).is_empty());
        assert!(machine.handle(SessionEvent::Focus("early")).is_empty());
        assert_eq!(machine.state().name(), "stopped");

        let mut idle = machine_in_idle();
        assert!(idle.handle(SessionEvent::Start).is_empty());
        assert!(idle.handle(SessionEvent::Unfocus).is_empty());
        assert_eq!(idle.state().name(), "idle");

        let mut focused = machine_in_idle();
        focused.handle(SessionEvent::Focus("buffer"));
        assert!(focused.handle(SessionEvent::Start).is_empty());
        assert_eq!(focused.focused(), Some(&"buffer"));
    }
}
