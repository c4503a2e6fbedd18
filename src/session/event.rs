use tokio::sync::mpsc;

use crate::net::protocol::ServerMessage;

/// Requests from the caller-facing handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Toggle,
    SendText(String),
    Shutdown,
}

/// Everything the session reacts to. Producers never touch session state;
/// they push one of these and the session applies it in arrival order.
#[derive(Debug)]
pub(crate) enum Event {
    Command(Command),
    Frame(Vec<f32>),
    Server {
        link: u64,
        message: ServerMessage,
    },
    LinkClosed {
        link: u64,
        error: Option<String>,
    },
    DeviceLost(String),
    SilenceElapsed {
        generation: u64,
    },
    FallbackElapsed {
        generation: u64,
    },
    PlaybackFinished {
        clip: u64,
    },
    SynthesisStarted {
        utterance: u64,
    },
    SynthesisFinished {
        utterance: u64,
    },
}

/// Sending side of the session's event queue.
///
/// Cloned into every producer: device threads, connection tasks, timers and
/// the synthesizer. Every method returns quietly once the session is gone.
#[derive(Debug, Clone)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<Event>,
}

impl Inbox {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Hand over one captured frame. Returns `false` once the session has
    /// stopped, which tells the capture thread to exit.
    pub fn push_frame(&self, frame: Vec<f32>) -> bool {
        self.send(Event::Frame(frame))
    }

    pub fn playback_finished(&self, clip: u64) {
        self.send(Event::PlaybackFinished { clip });
    }

    pub fn synthesis_started(&self, utterance: u64) {
        self.send(Event::SynthesisStarted { utterance });
    }

    pub fn synthesis_finished(&self, utterance: u64) {
        self.send(Event::SynthesisFinished { utterance });
    }

    pub fn server_message(&self, link: u64, message: ServerMessage) -> bool {
        self.send(Event::Server { link, message })
    }

    pub fn link_closed(&self, link: u64, error: Option<String>) {
        self.send(Event::LinkClosed { link, error });
    }

    pub fn device_lost(&self, reason: String) {
        self.send(Event::DeviceLost(reason));
    }
}
