use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::audio::{RenderDevice, device_name};
use crate::audio::decoder::AudioClip;
use crate::audio::resample::Resampler;
use crate::config::AudioConfig;
use crate::error::{Result, TokiError};
use crate::session::Inbox;

const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Samples waiting for the output callback, tagged with the clip they belong to.
#[derive(Default)]
struct RenderState {
    samples: VecDeque<f32>,
    clip: Option<u64>,
}

/// Speaker output via cpal.
///
/// Like capture, the stream is owned by a dedicated thread. Clips are
/// resampled to the device rate before being handed to the callback, so the
/// next clip can be queued the moment the previous one drains.
pub struct SpeakerOutput {
    device: Option<String>,
    worker: Option<RenderWorker>,
}

struct RenderWorker {
    state: Arc<Mutex<RenderState>>,
    device_rate: u32,
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl SpeakerOutput {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device: config.output_device.clone(),
            worker: None,
        }
    }
}

impl RenderDevice for SpeakerOutput {
    fn open(&mut self, inbox: &Inbox) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let state = Arc::new(Mutex::new(RenderState::default()));
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let device = self.device.clone();
        let inbox = inbox.clone();
        let thread_state = Arc::clone(&state);

        let thread = std::thread::Builder::new()
            .name("toki-render".to_string())
            .spawn(move || run_render(device, thread_state, &inbox, &ready_tx, &stop_rx))?;

        match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(device_rate)) => {
                tracing::info!("audio output opened at {device_rate} Hz");
                self.worker = Some(RenderWorker {
                    state,
                    device_rate,
                    stop_tx,
                    thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = stop_tx.send(());
                Err(TokiError::Device(
                    "timed out opening the output device".to_string(),
                ))
            }
        }
    }

    fn play(&mut self, clip_id: u64, clip: AudioClip) -> Result<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| TokiError::Device("output device is not open".to_string()))?;

        let samples = Resampler::new(clip.sample_rate, worker.device_rate, 1)?
            .process_all(&clip.samples)?;

        tracing::debug!(
            "rendering clip {clip_id}: {:.2}s ({} samples at {} Hz)",
            clip.duration_secs(),
            samples.len(),
            worker.device_rate
        );

        let mut state = worker.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.samples.clear();
        state.samples.extend(samples);
        state.clip = Some(clip_id);
        Ok(())
    }

    fn halt(&mut self) {
        if let Some(worker) = self.worker.as_ref() {
            let mut state = worker.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.samples.clear();
            state.clip = None;
        }
    }

    fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.stop_tx.send(());
        if worker.thread.join().is_err() {
            tracing::warn!("render thread panicked");
        }
        tracing::info!("audio output closed");
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_render(
    device: Option<String>,
    state: Arc<Mutex<RenderState>>,
    inbox: &Inbox,
    ready_tx: &Sender<Result<u32>>,
    stop_rx: &Receiver<()>,
) {
    let (stream, device_rate) = match open_stream(device.as_deref(), state, inbox) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(TokiError::Device(format!(
            "failed to start output stream: {e}"
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(device_rate));

    // Park until close; the callback does the work.
    let _ = stop_rx.recv();
    drop(stream);
    tracing::debug!("render thread exiting");
}

fn open_stream(
    name: Option<&str>,
    state: Arc<Mutex<RenderState>>,
    inbox: &Inbox,
) -> Result<(Stream, u32)> {
    let device = find_output_device(name)?;

    let supported = device
        .default_output_config()
        .map_err(|e| TokiError::Device(format!("failed to get default output config: {e}")))?;

    let sample_rate = supported.sample_rate();
    let channels = supported.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let width = usize::from(channels.max(1));
    let done_inbox = inbox.clone();
    let err_inbox = inbox.clone();

    let err_fn = move |err: cpal::StreamError| {
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            err_inbox.device_lost("output device is no longer available".to_string());
        } else {
            tracing::error!("audio output stream error: {err}");
        }
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(width) {
                    let sample = state.samples.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
                if state.samples.is_empty()
                    && let Some(clip_id) = state.clip.take()
                {
                    done_inbox.playback_finished(clip_id);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| TokiError::Device(format!("failed to build output stream: {e}")))?;

    Ok((stream, sample_rate))
}

fn find_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        return host
            .output_devices()
            .map_err(|e| TokiError::Device(format!("failed to enumerate output devices: {e}")))?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| TokiError::Device(format!("output device not found: {name}")));
    }

    host.default_output_device()
        .ok_or_else(|| TokiError::Device("no default output device available".to_string()))
}

/// Names of all render devices known to the default host.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| TokiError::Device(format!("failed to enumerate output devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_output_device_name() -> Option<String> {
    cpal::default_host()
        .default_output_device()
        .as_ref()
        .and_then(device_name)
}
