/// Accumulates 16kHz mono samples into fixed-size capture frames.
///
/// The capture device's callback size is not under our control, so samples
/// are regrouped here into frames of exactly `frame_samples`.
pub struct FrameAccumulator {
    buffer: Vec<f32>,
    frame_samples: usize,
}

impl FrameAccumulator {
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            buffer: Vec::with_capacity(frame_samples),
            frame_samples,
        }
    }

    /// Feed samples and return any complete frames, oldest first.
    pub fn feed(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.buffer.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_samples {
            frames.push(self.buffer.drain(..self.frame_samples).collect());
        }

        frames
    }

    /// Discard any partial frame (capture stopped mid-frame).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
