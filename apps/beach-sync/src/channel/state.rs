use std::fmt;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{ChannelError, ChannelEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initial,
    Pinging,
    Connecting,
    Connected,
    DisconnectedForever,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::DisconnectedForever)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (DisconnectedForever, _) => false,
            (_, DisconnectedForever) => true,
            (Initial, Pinging)
            | (Pinging, Connecting)
            | (Connecting, Connected)
            | (Connecting, Pinging)
            | (Connected, Pinging)
            | (Connected, Connecting) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initial => "initial",
            ConnectionState::Pinging => "pinging",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::DisconnectedForever => "disconnected_forever",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the connection state. All changes go through a
/// [`StateTransaction`] so the listener never observes an invalid edge.
pub struct StateMachine {
    state: ConnectionState,
    published: watch::Sender<ConnectionState>,
    listener: mpsc::UnboundedSender<ChannelEvent>,
}

impl StateMachine {
    pub fn new(
        published: watch::Sender<ConnectionState>,
        listener: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            state: ConnectionState::Initial,
            published,
            listener,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transaction(&mut self) -> StateTransaction<'_> {
        StateTransaction {
            machine: self,
            staged: Vec::new(),
        }
    }

    /// Single-step transaction.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), ChannelError> {
        let mut transaction = self.transaction();
        transaction.stage(next);
        transaction.commit().map(|_| ())
    }

    fn apply(&mut self, next: ConnectionState) {
        debug!(
            target = "beach_sync::channel",
            from = %self.state,
            to = %next,
            "connection state changed"
        );
        self.state = next;
        self.published.send_replace(next);
    }

    fn notify(&self, state: ConnectionState) {
        let _ = self.listener.send(ChannelEvent::StateChanged(state));
    }
}

/// Batch of staged transitions, validated as a chain before anything is applied.
pub struct StateTransaction<'a> {
    machine: &'a mut StateMachine,
    staged: Vec<ConnectionState>,
}

impl StateTransaction<'_> {
    pub fn stage(&mut self, next: ConnectionState) -> &mut Self {
        self.staged.push(next);
        self
    }

    /// Applies every staged transition and notifies the listener once with
    /// the final state. Nothing is applied if any edge is invalid.
    pub fn commit(self) -> Result<ConnectionState, ChannelError> {
        self.validate()?;
        let Some(&last) = self.staged.last() else {
            return Ok(self.machine.state);
        };
        for next in &self.staged {
            self.machine.apply(*next);
        }
        self.machine.notify(last);
        Ok(last)
    }

    /// Like [`StateTransaction::commit`] but notifies every intermediate state.
    pub fn force_apply(self) -> Result<ConnectionState, ChannelError> {
        self.validate()?;
        for next in &self.staged {
            self.machine.apply(*next);
            self.machine.notify(*next);
        }
        Ok(self.machine.state)
    }

    fn validate(&self) -> Result<(), ChannelError> {
        let mut from = self.machine.state;
        for &to in &self.staged {
            if !from.can_transition_to(to) {
                return Err(ChannelError::InvalidTransition { from, to });
            }
            from = to;
        }
        Ok(())
    }
}
