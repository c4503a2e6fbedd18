use std::time::Duration;

use super::event::{Event, Inbox};
use super::timer::Timer;

/// Which voice, if any, has spoken for the tutor's current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Voice {
    Silent,
    Server,
    Local,
}

/// Verdict on an inbound audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AudioVerdict {
    Play,
    /// Local speech already answered this turn.
    Drop,
}

/// Races server audio against local speech for each tutor turn.
///
/// Tutor text arms a timer. If no server audio shows up before it elapses,
/// the text is handed out for local synthesis; once that starts, the turn
/// belongs to the local voice and late server audio is dropped. Server audio
/// that arrives first disarms the timer and claims the turn.
#[derive(Debug)]
pub(crate) struct FallbackReconciler {
    delay: Option<Duration>,
    pending: Option<String>,
    deferred: Option<String>,
    timer: Option<Timer>,
    generation: u64,
    turn_open: bool,
    voice: Voice,
}

impl FallbackReconciler {
    /// `delay` of `None` disables local fallback speech.
    pub(crate) const fn new(delay: Option<Duration>) -> Self {
        Self {
            delay,
            pending: None,
            deferred: None,
            timer: None,
            generation: 0,
            turn_open: false,
            voice: Voice::Silent,
        }
    }

    fn open_turn(&mut self) {
        if !self.turn_open {
            self.turn_open = true;
            self.voice = Voice::Silent;
        }
    }

    pub(crate) fn on_server_text(&mut self, text: &str, inbox: &Inbox) {
        let Some(delay) = self.delay else {
            return;
        };

        self.open_turn();
        if self.voice == Voice::Server || text.trim().is_empty() {
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        self.pending = Some(text.to_string());
        self.timer = Some(Timer::schedule(
            delay,
            generation,
            inbox,
            Event::FallbackElapsed { generation },
        ));
    }

    pub(crate) fn on_server_audio(&mut self) -> AudioVerdict {
        self.open_turn();
        if self.voice == Voice::Local {
            return AudioVerdict::Drop;
        }

        self.voice = Voice::Server;
        let pending = self.pending.take();
        let deferred = self.deferred.take();
        if pending.is_some() || deferred.is_some() {
            tracing::debug!("server audio arrived, local fallback cancelled");
        }
        self.timer = None;
        AudioVerdict::Play
    }

    /// Text whose fallback timer just elapsed, if that timer is still current.
    pub(crate) fn take_due(&mut self, generation: u64) -> Option<String> {
        match &self.timer {
            Some(timer) if timer.generation() == generation => {
                self.timer = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Hold due text until the speaker is free.
    pub(crate) fn defer(&mut self, text: String) {
        self.deferred = Some(text);
    }

    pub(crate) fn take_deferred(&mut self) -> Option<String> {
        self.deferred.take()
    }

    /// Local synthesis has been started for this turn.
    pub(crate) fn spoke(&mut self) {
        self.voice = Voice::Local;
    }

    pub(crate) fn turn_complete(&mut self) {
        self.turn_open = false;
    }

    /// Barge-in ends the tutor's turn and drops any text not yet spoken.
    pub(crate) fn on_interrupted(&mut self) {
        self.timer = None;
        self.pending = None;
        self.deferred = None;
        self.turn_open = false;
    }

    pub(crate) fn reset(&mut self) {
        self.on_interrupted();
        self.voice = Voice::Silent;
    }

    #[cfg(test)]
    pub(crate) const fn is_armed(&self) -> bool {
        self.timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    const DELAY: Duration = Duration::from_secs(2);

    async fn elapsed(rx: &mut UnboundedReceiver<Event>) -> u64 {
        tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
        match rx.try_recv() {
            Ok(Event::FallbackElapsed { generation }) => generation,
            other => panic!("expected fallback timer, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn text_without_audio_falls_back() {
        let (inbox, mut rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(Some(DELAY));
        fallback.on_server_text("Photosynthesis turns light into sugar.", &inbox);
        assert!(fallback.is_armed());

        let generation = elapsed(&mut rx).await;
        assert_eq!(
            fallback.take_due(generation).as_deref(),
            Some("Photosynthesis turns light into sugar.")
        );
        assert_eq!(fallback.take_due(generation), None);
    }

    #[tokio::test(start_paused = true)]
    async fn server_audio_cancels_pending_text() {
        let (inbox, mut rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(Some(DELAY));
        fallback.on_server_text("Hello!", &inbox);
        tokio::time::sleep(Duration::from_millis(1999)).await;

        assert_eq!(fallback.on_server_audio(), AudioVerdict::Play);
        assert!(!fallback.is_armed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_audio_is_dropped_after_local_speech() {
        let (inbox, mut rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(Some(DELAY));
        fallback.on_server_text("Hello!", &inbox);
        let generation = elapsed(&mut rx).await;
        assert!(fallback.take_due(generation).is_some());
        fallback.spoke();

        assert_eq!(fallback.on_server_audio(), AudioVerdict::Drop);

        // The next turn starts fresh.
        fallback.turn_complete();
        assert_eq!(fallback.on_server_audio(), AudioVerdict::Play);
    }

    #[tokio::test(start_paused = true)]
    async fn text_after_audio_in_same_turn_is_not_armed() {
        let (inbox, _rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(Some(DELAY));
        assert_eq!(fallback.on_server_audio(), AudioVerdict::Play);
        fallback.on_server_text("caption for the audio", &inbox);
        assert!(!fallback.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_text_replaces_pending() {
        let (inbox, mut rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(Some(DELAY));
        fallback.on_server_text("first", &inbox);
        tokio::time::sleep(Duration::from_secs(1)).await;
        fallback.on_server_text("second", &inbox);

        let generation = elapsed(&mut rx).await;
        assert_eq!(fallback.take_due(generation).as_deref(), Some("second"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_clears_everything() {
        let (inbox, mut rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(Some(DELAY));
        fallback.on_server_text("pending", &inbox);
        fallback.defer("deferred".to_string());
        fallback.on_interrupted();

        assert!(!fallback.is_armed());
        assert_eq!(fallback.take_deferred(), None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_ends_a_turn_claimed_by_audio() {
        let (inbox, _rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(Some(DELAY));
        assert_eq!(fallback.on_server_audio(), AudioVerdict::Play);
        fallback.on_interrupted();

        fallback.on_server_text("next answer", &inbox);
        assert!(fallback.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_fallback_never_arms() {
        let (inbox, _rx) = Inbox::channel();
        let mut fallback = FallbackReconciler::new(None);
        fallback.on_server_text("anything", &inbox);
        assert!(!fallback.is_armed());
    }
}
