pub mod buffer;
pub mod capture;
pub mod decoder;
pub mod encoder;
pub mod render;
pub mod resample;

use cpal::traits::DeviceTrait;

use crate::error::Result;
use crate::session::Inbox;

use self::decoder::AudioClip;

/// Rate at which frames are captured and streamed to the tutor.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Rate of raw PCM chunks streamed back by the tutor.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Microphone owned by a session.
///
/// `start` is idempotent while running; `stop` is unconditional and releases
/// the device. Frames are pushed into the session inbox in capture order.
pub trait CaptureDevice: Send {
    fn start(&mut self, inbox: &Inbox) -> Result<()>;
    fn stop(&mut self);
}

/// Speaker owned by a session.
///
/// At most one clip renders at a time. When a clip's last sample has been
/// handed to the device the implementation reports
/// [`Inbox::playback_finished`] with the clip id. `halt` stops the current
/// clip without reporting completion.
pub trait RenderDevice: Send {
    fn open(&mut self, inbox: &Inbox) -> Result<()>;
    fn play(&mut self, clip_id: u64, clip: AudioClip) -> Result<()>;
    fn halt(&mut self);
    fn close(&mut self);
}

/// Human-readable name cpal reports for a device.
pub(crate) fn device_name(device: &cpal::Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}
