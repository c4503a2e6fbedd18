use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::audio::buffer::FrameAccumulator;
use crate::audio::resample::Resampler;
use crate::audio::{CAPTURE_SAMPLE_RATE, CaptureDevice, device_name};
use crate::config::AudioConfig;
use crate::error::{Result, TokiError};
use crate::session::Inbox;

const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Microphone capture via cpal.
///
/// The cpal stream lives on a dedicated thread for as long as capture runs;
/// that thread also resamples to 16kHz mono and cuts fixed-size frames.
pub struct MicrophoneCapture {
    device: Option<String>,
    frame_samples: usize,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl MicrophoneCapture {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device: config.input_device.clone(),
            frame_samples: config.frame_samples,
            worker: None,
        }
    }
}

impl CaptureDevice for MicrophoneCapture {
    fn start(&mut self, inbox: &Inbox) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(u32, u16)>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let device = self.device.clone();
        let frame_samples = self.frame_samples;
        let inbox = inbox.clone();

        let thread = std::thread::Builder::new()
            .name("toki-capture".to_string())
            .spawn(move || run_capture(device, frame_samples, &inbox, &ready_tx, &stop_rx))?;

        match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok((rate, channels))) => {
                tracing::info!(
                    "microphone capture started: source_rate={rate}, channels={channels}, frame={}",
                    self.frame_samples
                );
                self.worker = Some(CaptureWorker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = stop_tx.send(());
                Err(TokiError::Device(
                    "timed out opening the input device".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.stop_tx.send(());
        if worker.thread.join().is_err() {
            tracing::warn!("capture thread panicked");
        }
        tracing::info!("microphone capture stopped");
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    device: Option<String>,
    frame_samples: usize,
    inbox: &Inbox,
    ready_tx: &Sender<Result<(u32, u16)>>,
    stop_rx: &Receiver<()>,
) {
    let (stream, raw_rx, sample_rate, channels) = match open_stream(device.as_deref(), inbox) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut resampler = match Resampler::new(sample_rate, CAPTURE_SAMPLE_RATE, channels) {
        Ok(r) => r,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(TokiError::Device(format!(
            "failed to start audio stream: {e}"
        ))));
        return;
    }

    let _ = ready_tx.send(Ok((sample_rate, channels)));

    let mut accumulator = FrameAccumulator::new(frame_samples);
    let mut frames_sent = 0u64;

    loop {
        crossbeam_channel::select! {
            recv(raw_rx) -> raw => {
                let Ok(raw) = raw else { break };
                let mono_16k = match resampler.process(&raw) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("resample error: {e}");
                        continue;
                    }
                };

                for frame in accumulator.feed(&mono_16k) {
                    if !inbox.push_frame(frame) {
                        tracing::debug!("session inbox closed, stopping capture");
                        return;
                    }
                    frames_sent += 1;
                }
            }
            recv(stop_rx) -> _ => break,
        }
    }

    drop(stream);
    if accumulator.pending() > 0 {
        tracing::debug!("discarding {} samples of partial frame", accumulator.pending());
        accumulator.clear();
    }
    tracing::debug!("capture thread exiting after {frames_sent} frames");
}

fn open_stream(
    name: Option<&str>,
    inbox: &Inbox,
) -> Result<(Stream, Receiver<Vec<f32>>, u32, u16)> {
    let device = find_input_device(name)?;

    let supported = device
        .default_input_config()
        .map_err(|e| TokiError::Device(format!("failed to get default input config: {e}")))?;

    let sample_rate = supported.sample_rate();
    let channels = supported.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    // Bounded; the audio callback must never block
    let (tx, rx) = bounded::<Vec<f32>>(64);

    let err_inbox = inbox.clone();
    let err_fn = move |err: cpal::StreamError| {
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            err_inbox.device_lost("input device is no longer available".to_string());
        } else {
            tracing::error!("audio input stream error: {err}");
        }
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let _ = tx.try_send(data.to_vec());
            },
            err_fn,
            None,
        )
        .map_err(|e| TokiError::Device(format!("failed to build input stream: {e}")))?;

    Ok((stream, rx, sample_rate, channels))
}

fn find_input_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        return host
            .input_devices()
            .map_err(|e| TokiError::Device(format!("failed to enumerate input devices: {e}")))?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| TokiError::Device(format!("input device not found: {name}")));
    }

    host.default_input_device()
        .ok_or_else(|| TokiError::Device("no default input device available".to_string()))
}

/// Names of all capture devices known to the default host.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| TokiError::Device(format!("failed to enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .as_ref()
        .and_then(device_name)
}
