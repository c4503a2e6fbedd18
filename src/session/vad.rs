use std::time::Duration;

use tokio::time::Instant;

use super::event::{Event, Inbox};
use super::timer::Timer;

/// Infers the end of the learner's turn from outgoing frames alone.
///
/// A frame whose peak amplitude exceeds the threshold counts as speech. The
/// first quiet frame after speech arms a silence timer, unless the session
/// is already waiting on the tutor; any louder frame disarms it.
#[derive(Debug)]
pub(crate) struct VoiceActivityMonitor {
    threshold: f32,
    silence: Duration,
    has_speech: bool,
    last_speech: Option<Instant>,
    generation: u64,
    timer: Option<Timer>,
}

impl VoiceActivityMonitor {
    pub(crate) const fn new(threshold: f32, silence: Duration) -> Self {
        Self {
            threshold,
            silence,
            has_speech: false,
            last_speech: None,
            generation: 0,
            timer: None,
        }
    }

    pub(crate) fn observe(&mut self, frame: &[f32], processing: bool, inbox: &Inbox) {
        if peak(frame) > self.threshold {
            self.has_speech = true;
            self.last_speech = Some(Instant::now());
            self.timer = None;
            return;
        }

        if self.has_speech && self.timer.is_none() && !processing {
            self.generation += 1;
            let generation = self.generation;
            tracing::debug!(
                "silence after speech, end of turn in {}ms",
                self.silence.as_millis()
            );
            self.timer = Some(Timer::schedule(
                self.silence,
                generation,
                inbox,
                Event::SilenceElapsed { generation },
            ));
        }
    }

    /// Consume an elapsed silence timer. Returns `true` only for the timer
    /// currently armed; the turn's speech is then considered finished.
    pub(crate) fn elapsed(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation() == generation => {
                self.timer = None;
                self.has_speech = false;
                if let Some(at) = self.last_speech {
                    tracing::debug!("{}ms since last speech", at.elapsed().as_millis());
                }
                true
            }
            _ => false,
        }
    }

    /// Disarm the silence timer, keeping what has been heard so far.
    pub(crate) fn cancel(&mut self) {
        self.timer = None;
    }

    /// Forget the current turn entirely.
    pub(crate) fn reset(&mut self) {
        self.timer = None;
        self.has_speech = false;
        self.last_speech = None;
    }

    #[cfg(test)]
    pub(crate) const fn is_armed(&self) -> bool {
        self.timer.is_some()
    }
}

fn peak(frame: &[f32]) -> f32 {
    frame.iter().fold(0.0f32, |max, s| max.max(s.abs()))
}
