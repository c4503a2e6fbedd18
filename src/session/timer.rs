use std::time::Duration;

use tokio::task::JoinHandle;

use super::event::{Event, Inbox};

/// A one-shot timer that posts an event back into the session.
///
/// Dropping the timer aborts it. Each timer carries the generation it was
/// armed for, so an elapsed event that raced a cancellation can still be
/// recognized as stale by its owner.
#[derive(Debug)]
pub(crate) struct Timer {
    generation: u64,
    task: JoinHandle<()>,
}

impl Timer {
    pub(crate) fn schedule(delay: Duration, generation: u64, inbox: &Inbox, event: Event) -> Self {
        let inbox = inbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inbox.send(event);
        });
        Self { generation, task }
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
