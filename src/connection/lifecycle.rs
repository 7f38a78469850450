use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Start,
    Opened,
    OpenFailed,
    Closed,
    TimerFired,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Connect,
    ScheduleReconnect(Duration),
    CancelReconnect,
    Disconnect,
}

/// Reconnect policy as a pure state machine. The reconnect timer exists
/// exactly while the state is `ReconnectPending`, so at most one is ever
/// pending.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LinkState,
    reconnect_delay: Duration,
}

impl Lifecycle {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: LinkState::Disconnected,
            reconnect_delay,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    #[cfg(test)]
    pub fn pending_timers(&self) -> usize {
        usize::from(self.state == LinkState::ReconnectPending)
    }

    pub fn handle(&mut self, event: LinkEvent) -> Option<LinkAction> {
        use LinkAction as A;
        use LinkEvent as E;
        use LinkState as S;

        let (next, action) = match (self.state, event) {
            (S::Disconnected, E::Start) => (S::Connecting, Some(A::Connect)),
            (S::Connecting, E::Opened) => (S::Connected, None),
            (S::Connecting, E::OpenFailed | E::Closed) | (S::Connected, E::Closed) => (
                S::ReconnectPending,
                Some(A::ScheduleReconnect(self.reconnect_delay)),
            ),
            (S::ReconnectPending, E::TimerFired) => (S::Connecting, Some(A::Connect)),
            (S::Connecting | S::Connected, E::Stop) => (S::Disconnected, Some(A::Disconnect)),
            (S::ReconnectPending, E::Stop) => (S::Disconnected, Some(A::CancelReconnect)),
            (state, event) => {
                tracing::trace!(?state, ?event, "link event ignored");
                (state, None)
            }
        };
        self.state = next;
        action
    }
}
