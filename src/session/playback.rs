use std::collections::VecDeque;

use crate::audio::RenderDevice;
use crate::audio::decoder::decode_clip;

/// FIFO of audio containers waiting to be rendered, one at a time.
#[derive(Debug, Default)]
pub(crate) struct PlaybackQueue {
    items: VecDeque<Vec<u8>>,
    current: Option<u64>,
    next_clip: u64,
}

impl PlaybackQueue {
    pub(crate) fn enqueue(&mut self, container: Vec<u8>) {
        self.items.push_back(container);
    }

    /// Start the head item unless something is already rendering.
    ///
    /// Items that fail to decode or render are logged and skipped. Returns
    /// whether a clip is rendering afterwards.
    pub(crate) fn play_next(&mut self, device: &mut dyn RenderDevice) -> bool {
        if self.current.is_some() {
            return true;
        }

        while let Some(container) = self.items.pop_front() {
            let clip = match decode_clip(&container) {
                Ok(clip) => clip,
                Err(e) => {
                    tracing::warn!("skipping audio chunk: {e}");
                    continue;
                }
            };

            let id = self.next_clip;
            self.next_clip += 1;
            match device.play(id, clip) {
                Ok(()) => {
                    self.current = Some(id);
                    return true;
                }
                Err(e) => tracing::warn!("skipping audio chunk: {e}"),
            }
        }

        false
    }

    /// Record that `clip` finished. Returns `false` for a clip that is no
    /// longer current, such as one halted by a flush.
    pub(crate) fn finished(&mut self, clip: u64) -> bool {
        if self.current == Some(clip) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Drop everything queued and halt the clip in progress.
    pub(crate) fn flush(&mut self, device: &mut dyn RenderDevice) {
        let dropped = self.items.len();
        self.items.clear();
        if self.current.take().is_some() {
            device.halt();
        }
        if dropped > 0 {
            tracing::debug!("flushed {dropped} queued audio chunks");
        }
    }

    pub(crate) const fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
