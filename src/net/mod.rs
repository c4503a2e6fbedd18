pub mod client;
pub mod protocol;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LearnerConfig;
use crate::error::{Result, TokiError};
use crate::session::Inbox;

use self::protocol::ClientMessage;

/// Outbound queue depth per connection.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Opens streaming connections to the tutoring endpoint.
///
/// `open` must not block on the handshake: it returns a [`Link`] right away
/// and reports inbound messages and closure through the inbox, tagged with
/// `link_id` so that events from a superseded connection can be told apart.
pub trait Connector: Send {
    fn open(&mut self, learner: &LearnerConfig, link_id: u64, inbox: &Inbox) -> Result<Link>;
}

/// The session's handle on one open connection.
///
/// Dropping the link closes the outbound queue, which makes the connection
/// task send a close frame and exit.
pub struct Link {
    id: u64,
    outbound: mpsc::Sender<ClientMessage>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    #[must_use]
    pub const fn new(
        id: u64,
        outbound: mpsc::Sender<ClientMessage>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { id, outbound, task }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message without waiting. Returns `false` if it was not queued.
    pub fn try_send(&self, message: ClientMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                if !message.is_droppable() {
                    tracing::warn!("outbound queue full, control message not sent");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a control message without waiting.
    ///
    /// Returns `Ok(false)` if the connection task is already gone. A full
    /// queue means the connection has stalled and is reported as a transport
    /// error, since control messages must not be dropped.
    pub fn send(&self, message: ClientMessage) -> Result<bool> {
        match self.outbound.try_send(message) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TokiError::Transport(
                "connection stalled, outbound queue is full".to_string(),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(false),
        }
    }

    /// Close the connection. The connection task is given the chance to send
    /// a close frame; it is not awaited.
    pub fn close(mut self) {
        drop(self.task.take());
        tracing::debug!("link {} closed", self.id);
    }
}
