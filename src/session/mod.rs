//! The live tutoring session.
//!
//! A [`Session`] is an actor: it owns the connection, the devices, the
//! playback queue and every timer, and it mutates them only from
//! [`Session::run`]. Device threads, connection tasks, timers and the
//! synthesizer never touch that state; they post events to the session's
//! [`Inbox`] and the session applies them one at a time, in arrival order.

mod event;
mod fallback;
mod handle;
mod playback;
mod timer;
mod vad;

#[cfg(test)]
mod tests;

use tokio::sync::{mpsc, watch};

use crate::audio::decoder::{decode_payload, into_container};
use crate::audio::encoder::encode_frame;
use crate::audio::{CaptureDevice, RenderDevice};
use crate::config::{Config, LearnerConfig};
use crate::error::TokiError;
use crate::net::protocol::{ClientMessage, ServerMessage};
use crate::net::{Connector, Link};
use crate::speech::SpeechSynthesizer;

pub(crate) use self::event::{Command, Event};
pub use self::event::Inbox;
pub use self::handle::{Phase, SessionHandle, SessionStatus};

use self::fallback::{AudioVerdict, FallbackReconciler};
use self::playback::PlaybackQueue;
use self::vad::VoiceActivityMonitor;

/// Receives what the learner should see.
pub trait SessionObserver: Send {
    fn on_transcript(&mut self, text: &str, is_user: bool);
    fn on_error(&mut self, message: &str);
}

/// Everything a session drives. Each is owned exclusively by the session.
pub struct Devices {
    pub connector: Box<dyn Connector>,
    pub capture: Box<dyn CaptureDevice>,
    pub render: Box<dyn RenderDevice>,
    pub synthesizer: Box<dyn SpeechSynthesizer>,
}

pub struct Session {
    learner: LearnerConfig,
    inbox: Inbox,
    events: mpsc::UnboundedReceiver<Event>,
    status: watch::Sender<SessionStatus>,
    observer: Box<dyn SessionObserver>,

    connector: Box<dyn Connector>,
    capture: Box<dyn CaptureDevice>,
    render: Box<dyn RenderDevice>,
    synthesizer: Box<dyn SpeechSynthesizer>,

    phase: Phase,
    listening: bool,
    processing: bool,
    link: Option<Link>,
    next_link: u64,

    vad: VoiceActivityMonitor,
    fallback: FallbackReconciler,
    playback: PlaybackQueue,
    utterance: Option<u64>,
    next_utterance: u64,
    speaking_locally: bool,
}

impl Session {
    #[must_use]
    pub fn new(
        config: &Config,
        devices: Devices,
        observer: Box<dyn SessionObserver>,
    ) -> (Self, SessionHandle) {
        let (inbox, events) = Inbox::channel();
        let (status, status_rx) = watch::channel(SessionStatus::default());
        let handle = SessionHandle::new(inbox.clone(), status_rx);

        let session = Self {
            learner: config.learner.clone(),
            inbox,
            events,
            status,
            observer,
            connector: devices.connector,
            capture: devices.capture,
            render: devices.render,
            synthesizer: devices.synthesizer,
            phase: Phase::Idle,
            listening: false,
            processing: false,
            link: None,
            next_link: 1,
            vad: VoiceActivityMonitor::new(config.vad.threshold, config.vad.silence()),
            fallback: FallbackReconciler::new(config.fallback.delay()),
            playback: PlaybackQueue::default(),
            utterance: None,
            next_utterance: 1,
            speaking_locally: false,
        };

        (session, handle)
    }

    /// Process events until [`SessionHandle::shutdown`]. Everything the
    /// session holds is released before this returns.
    pub async fn run(mut self) {
        tracing::debug!("session started");
        while let Some(event) = self.events.recv().await {
            if matches!(event, Event::Command(Command::Shutdown)) {
                break;
            }
            self.handle(event);
            self.publish();
        }

        self.teardown(Phase::Idle);
        self.publish();
        tracing::debug!("session stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command),
            Event::Frame(frame) => self.on_frame(&frame),
            Event::Server { link, message } => {
                if self.is_current(link) {
                    self.on_server_message(message);
                } else {
                    tracing::debug!("ignoring {} from stale link {link}", message.kind());
                }
            }
            Event::LinkClosed { link, error } => self.on_link_closed(link, error),
            Event::DeviceLost(reason) => {
                if matches!(self.phase, Phase::Connecting | Phase::Active) {
                    self.fail(&TokiError::Device(reason));
                }
            }
            Event::SilenceElapsed { generation } => self.on_silence(generation),
            Event::FallbackElapsed { generation } => {
                if let Some(text) = self.fallback.take_due(generation) {
                    self.speak_or_defer(text);
                }
            }
            Event::PlaybackFinished { clip } => {
                if self.playback.finished(clip) && !self.playback.play_next(self.render.as_mut()) {
                    self.speak_deferred();
                }
            }
            Event::SynthesisStarted { utterance } => {
                if self.utterance == Some(utterance) {
                    self.speaking_locally = true;
                }
            }
            Event::SynthesisFinished { utterance } => {
                if self.utterance == Some(utterance) {
                    self.utterance = None;
                    self.speaking_locally = false;
                    self.speak_deferred();
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Toggle => {
                if matches!(self.phase, Phase::Idle | Phase::Closed) {
                    self.connect();
                } else {
                    self.disconnect();
                }
            }
            Command::SendText(text) => self.send_text(text),
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self) {
        if matches!(self.phase, Phase::Connecting | Phase::Active) {
            return;
        }

        let id = self.next_link;
        self.next_link += 1;
        match self.connector.open(&self.learner, id, &self.inbox) {
            Ok(link) => {
                self.link = Some(link);
                self.phase = Phase::Connecting;
                self.processing = true;
            }
            Err(e) => {
                tracing::error!("{e}");
                self.observer.on_error(&e.to_string());
            }
        }
    }

    fn disconnect(&mut self) {
        if matches!(self.phase, Phase::Idle | Phase::Closed) {
            return;
        }
        tracing::info!("disconnecting");
        self.teardown(Phase::Idle);
    }

    fn send_text(&mut self, text: String) {
        if self.phase != Phase::Active {
            tracing::warn!("not connected, typed turn dropped");
            return;
        }

        let message = ClientMessage::Text { data: text.clone() };
        if !self.send_control(message) {
            tracing::warn!("typed turn not sent");
            return;
        }

        self.processing = true;
        self.vad.reset();
        self.observer.on_transcript(&text, true);
    }

    fn on_frame(&mut self, frame: &[f32]) {
        if !self.listening {
            return;
        }

        self.vad.observe(frame, self.processing, &self.inbox);

        if let Some(link) = self.link.as_ref() {
            link.try_send(ClientMessage::Audio {
                data: encode_frame(frame),
            });
        }
    }

    fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::SetupComplete => self.activate(),
            ServerMessage::Audio { data } => self.on_server_audio(&data),
            ServerMessage::Text { data, is_user } => {
                self.observer.on_transcript(&data, is_user);
                if !is_user {
                    self.fallback.on_server_text(&data, &self.inbox);
                }
            }
            ServerMessage::UserText { data } => self.observer.on_transcript(&data, true),
            ServerMessage::TurnComplete => {
                self.processing = false;
                self.fallback.turn_complete();
            }
            ServerMessage::Interrupted => {
                tracing::info!("tutor interrupted");
                self.playback.flush(self.render.as_mut());
                self.cancel_synthesis();
                self.fallback.on_interrupted();
                self.vad.cancel();
            }
            ServerMessage::Error { message } => {
                tracing::warn!("server error: {message}");
                self.observer.on_error(&message);
                self.processing = false;
                self.fallback.turn_complete();
            }
        }
    }

    fn activate(&mut self) {
        if self.phase != Phase::Connecting {
            tracing::debug!("setup_complete while {:?}, ignored", self.phase);
            return;
        }

        if let Err(e) = self.render.open(&self.inbox) {
            self.fail(&e);
            return;
        }
        if let Err(e) = self.capture.start(&self.inbox) {
            self.fail(&e);
            return;
        }

        self.phase = Phase::Active;
        self.listening = true;
        self.processing = false;
        tracing::info!("session active, listening");
    }

    fn on_server_audio(&mut self, data: &str) {
        if self.phase != Phase::Active {
            return;
        }

        if self.fallback.on_server_audio() == AudioVerdict::Drop {
            tracing::debug!("local speech already answered this turn, audio dropped");
            return;
        }
        self.cancel_synthesis();

        match decode_payload(data) {
            Ok(payload) => {
                self.playback.enqueue(into_container(payload));
                self.playback.play_next(self.render.as_mut());
            }
            Err(e) => tracing::warn!("{e}"),
        }
    }

    fn on_silence(&mut self, generation: u64) {
        if !self.vad.elapsed(generation) || self.processing || self.phase != Phase::Active {
            return;
        }

        if self.send_control(ClientMessage::EndTurn) {
            tracing::info!("end of turn detected");
            self.processing = true;
        }
    }

    fn on_link_closed(&mut self, link: u64, error: Option<String>) {
        if !self.is_current(link) {
            return;
        }

        self.link = None;
        match error {
            Some(reason) => {
                let error = TokiError::Transport(reason);
                tracing::error!("{error}");
                self.observer.on_error(&error.to_string());
            }
            None => tracing::info!("connection closed by server"),
        }
        self.teardown(Phase::Closed);
    }

    /// Queue a control message. A stalled connection is torn down rather
    /// than waited on.
    fn send_control(&mut self, message: ClientMessage) -> bool {
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        match link.send(message) {
            Ok(sent) => sent,
            Err(e) => {
                tracing::error!("{e}");
                self.observer.on_error(&e.to_string());
                self.teardown(Phase::Closed);
                false
            }
        }
    }

    fn speak_or_defer(&mut self, text: String) {
        if self.playback.is_playing() || self.utterance.is_some() {
            self.fallback.defer(text);
            return;
        }

        let id = self.next_utterance;
        self.next_utterance += 1;
        match self.synthesizer.speak(id, &text, &self.inbox) {
            Ok(()) => {
                tracing::info!("tutor audio is late, speaking locally");
                self.utterance = Some(id);
                self.fallback.spoke();
            }
            Err(e) => tracing::warn!("{e}"),
        }
    }

    fn speak_deferred(&mut self) {
        if let Some(text) = self.fallback.take_deferred() {
            self.speak_or_defer(text);
        }
    }

    fn cancel_synthesis(&mut self) {
        if self.utterance.take().is_some() {
            self.synthesizer.cancel();
        }
        self.speaking_locally = false;
    }

    fn fail(&mut self, error: &TokiError) {
        tracing::error!("{error}");
        self.observer.on_error(&error.to_string());
        self.teardown(Phase::Idle);
    }

    /// Release everything and settle in `phase`. Safe to call from any state.
    fn teardown(&mut self, phase: Phase) {
        self.phase = Phase::Closing;
        self.publish();

        self.capture.stop();
        self.listening = false;

        self.playback.flush(self.render.as_mut());
        self.render.close();

        self.vad.reset();
        self.fallback.reset();
        self.cancel_synthesis();

        if let Some(link) = self.link.take() {
            link.close();
        }

        self.processing = false;
        self.phase = phase;
    }

    fn is_current(&self, link: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.id() == link)
    }

    fn publish(&self) {
        let next = SessionStatus {
            phase: self.phase,
            listening: self.listening,
            speaking: self.playback.is_playing() || self.speaking_locally,
            processing: self.processing,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
