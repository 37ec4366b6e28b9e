use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample as _, SampleFormat, SizedSample};
use tracing::{debug, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

/// Poll interval for the threads that keep cpal streams alive. The streams are
/// `!Send`, so each lives on its own OS thread and is dropped when the owning
/// handle flips the stop flag.
const STREAM_PARK_INTERVAL: Duration = Duration::from_millis(100);

/// Microphone capture feeding the shared local audio track. Samples cross the
/// wire as little-endian f32 frames; a muted capture keeps the track alive but
/// writes silence.
pub struct AudioCapture {
    stop: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
}

impl AudioCapture {
    /// Open the default input device and start feeding `track`. Device or
    /// stream setup failure is returned to the caller; it is fatal to joining.
    pub fn start(track: Arc<TrackLocalStaticSample>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let muted = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let thread_stop = stop.clone();
        let thread_muted = muted.clone();
        std::thread::spawn(move || {
            capture_thread(track, thread_muted, thread_stop, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop, muted }),
            Ok(Err(msg)) => Err(Error::Audio(msg)),
            Err(_) => Err(Error::Audio("capture thread exited during setup".into())),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Flip mute and return the new state.
    pub fn toggle_muted(&self) -> bool {
        let muted = !self.muted.load(Ordering::Relaxed);
        self.muted.store(muted, Ordering::Relaxed);
        muted
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn capture_thread(
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    ready: std_mpsc::SyncSender<std::result::Result<(), String>>,
) {
    match open_input_stream(track, muted) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(STREAM_PARK_INTERVAL);
            }
            drop(stream);
        }
        Err(msg) => {
            let _ = ready.send(Err(msg));
        }
    }
}

fn open_input_stream(
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
) -> std::result::Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "no input device available".to_string())?;
    let config = device.default_input_config().map_err(|e| e.to_string())?;
    debug!(?config, "input device config");

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config.into(), track, muted),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config.into(), track, muted),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config.into(), track, muted),
        other => Err(format!("unsupported sample format: {other:?}")),
    }?;
    stream.play().map_err(|e| e.to_string())?;
    Ok(stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
) -> std::result::Result<cpal::Stream, String>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let sample_rate = config.sample_rate.0.max(1);
    let err_fn = |err| warn!(error = %err, "input audio stream error");

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut payload = Vec::with_capacity(data.len() * 4);
                if muted.load(Ordering::Relaxed) {
                    payload.resize(data.len() * 4, 0);
                } else {
                    for sample in data {
                        let value: f32 = f32::from_sample(*sample);
                        payload.extend_from_slice(&value.to_le_bytes());
                    }
                }
                let frames = (data.len() / channels) as u32;
                let sample = Sample {
                    data: Bytes::from(payload),
                    duration: Duration::from_secs_f64(f64::from(frames) / f64::from(sample_rate)),
                    ..Default::default()
                };
                if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                    warn!(error = %e, "failed to write capture sample");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| e.to_string())
}

/// Speaker playback for one remote participant's track. Dropping the handle
/// stops the RTP reader and releases the output stream; replacing a peer's
/// playback is therefore just dropping the old handle.
pub struct AudioPlayback {
    stop: Arc<AtomicBool>,
}

impl AudioPlayback {
    /// Start draining `track` to the default output device. Setup failures are
    /// logged, not returned: a peer without working playback still holds a
    /// healthy link.
    pub fn start(peer: &str, track: Arc<TrackRemote>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (sample_tx, sample_rx) = std_mpsc::channel::<Vec<f32>>();

        let reader_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                if reader_stop.load(Ordering::Relaxed) {
                    break;
                }
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        if sample_tx.send(decode_f32_le(&packet.payload)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let thread_stop = stop.clone();
        let peer = peer.to_string();
        std::thread::spawn(move || {
            if let Err(msg) = run_output(sample_rx, thread_stop) {
                warn!(peer = %peer, error = %msg, "audio playback unavailable");
            }
        });

        Self { stop }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn run_output(
    rx: std_mpsc::Receiver<Vec<f32>>,
    stop: Arc<AtomicBool>,
) -> std::result::Result<(), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device available".to_string())?;
    let config = device.default_output_config().map_err(|e| e.to_string())?;
    debug!(?config, "output device config");

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config.into(), rx),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config.into(), rx),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config.into(), rx),
        other => Err(format!("unsupported sample format: {other:?}")),
    }?;
    stream.play().map_err(|e| e.to_string())?;

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(STREAM_PARK_INTERVAL);
    }
    Ok(())
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    rx: std_mpsc::Receiver<Vec<f32>>,
) -> std::result::Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32>,
{
    let mut pending: VecDeque<f32> = VecDeque::new();
    let err_fn = |err| warn!(error = %err, "output audio stream error");

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                while pending.len() < data.len() {
                    match rx.try_recv() {
                        Ok(samples) => pending.extend(samples),
                        Err(_) => break,
                    }
                }
                for out in data.iter_mut() {
                    *out = match pending.pop_front() {
                        Some(value) => T::from_sample(value),
                        None => T::EQUILIBRIUM,
                    };
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| e.to_string())
}

fn decode_f32_le(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
