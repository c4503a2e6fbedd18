use tokio::sync::watch;

use crate::error::{Result, TokiError};

use super::event::{Command, Event, Inbox};

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Active,
    /// Teardown in progress.
    Closing,
    /// The transport closed underneath the session.
    Closed,
}

/// Snapshot of what the session is doing, published after every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub phase: Phase,
    pub listening: bool,
    pub speaking: bool,
    pub processing: bool,
}

impl SessionStatus {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Active
    }

    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    #[must_use]
    pub const fn is_processing(&self) -> bool {
        self.processing
    }
}

/// Caller-facing control surface of a running [`Session`](super::Session).
///
/// Cheap to clone. Requests are queued to the session and applied in order;
/// they fail only once the session has shut down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inbox: Inbox,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub(crate) const fn new(inbox: Inbox, status: watch::Receiver<SessionStatus>) -> Self {
        Self { inbox, status }
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.inbox.send(Event::Command(command)) {
            Ok(())
        } else {
            Err(TokiError::SessionClosed)
        }
    }

    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn toggle(&self) -> Result<()> {
        self.command(Command::Toggle)
    }

    /// Send a typed turn. Blank text is ignored.
    pub fn send_text(&self, text: &str) -> Result<()> {
        if !self.status().is_connected() {
            return Err(TokiError::NotConnected);
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.command(Command::SendText(text.to_string()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Receiver that is notified whenever the status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}
