//! Live microphone metering via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not allocate, block or perform I/O. The callback therefore only
//! folds frames into a [`BlockMeter`] and pushes one dBFS value per sample
//! period into the SPSC ring with the wait-free `try_push`.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`MicrophoneSource`] itself stays `Send`: the stream is created,
//! kept alive and dropped on a dedicated `driftlab-mic` thread, and the
//! device-open result is handed back to `start()` over a sync oneshot.
//!
//! # Recording
//!
//! With [`record_to`](MicrophoneSource::record_to) set, the callback also
//! pushes each mono sample into a second SPSC ring. The owner thread drains
//! that ring into a [`SegmentRecorder`] every poll, so file I/O never runs on
//! the audio thread. [`rotate`](MeteringSource::rotate) swaps the recorder's
//! writer under a short lock.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{MeteringSource, SegmentRecorder};
use crate::{
    buffering::{chunk::BlockMeter, create_pcm_ring, MeteringConsumer, MeteringProducer, Producer},
    error::{DriftError, Result},
};

/// How often the owner thread re-checks its stop conditions.
const OWNER_POLL: Duration = Duration::from_millis(50);

/// Seconds of raw PCM the recording ring holds between owner polls.
const PCM_RING_SECONDS: usize = 2;

type SharedRecorder = Arc<Mutex<Option<SegmentRecorder>>>;

pub struct MicrophoneSource {
    preferred_device: Option<String>,
    sample_period_ms: u64,
    recording_dir: Option<PathBuf>,
    recorder: SharedRecorder,
    stop_flag: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    dropped_pcm: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
    device_name: Option<String>,
}

impl MicrophoneSource {
    /// Default input device, one metering value per `sample_period`.
    pub fn new(sample_period: Duration) -> Self {
        Self {
            preferred_device: None,
            sample_period_ms: (sample_period.as_millis() as u64).max(1),
            recording_dir: None,
            recorder: Arc::new(Mutex::new(None)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            dropped_pcm: Arc::new(AtomicU64::new(0)),
            worker: None,
            device_name: None,
        }
    }

    /// Prefer the input device with this exact name, falling back to the
    /// default input and then to the first available input.
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.preferred_device = Some(name.into());
        self
    }

    /// Record the captured audio as WAV segments under `dir`, one file per
    /// rotation interval.
    pub fn record_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recording_dir = Some(dir.into());
        self
    }

    /// Metering values dropped because the ring was full.
    pub fn dropped_values(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Raw samples lost because the owner thread fell behind.
    pub fn dropped_pcm_samples(&self) -> u64 {
        self.dropped_pcm.load(Ordering::Relaxed)
    }

    /// Names of all input devices on the default host.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| DriftError::SourceUnavailable(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl MeteringSource for MicrophoneSource {
    fn start(&mut self, producer: MeteringProducer, running: Arc<AtomicBool>) -> Result<()> {
        if self.worker.is_some() {
            return Err(DriftError::AlreadyRunning);
        }
        self.stop_flag.store(false, Ordering::SeqCst);

        let preferred = self.preferred_device.clone();
        let period_ms = self.sample_period_ms;
        let recording_dir = self.recording_dir.clone();
        let recorder = Arc::clone(&self.recorder);
        let stop_flag = Arc::clone(&self.stop_flag);
        let dropped = Arc::clone(&self.dropped);
        let dropped_pcm = Arc::clone(&self.dropped_pcm);
        let (open_tx, open_rx) = mpsc::channel::<Result<String>>();

        let worker = std::thread::Builder::new()
            .name("driftlab-mic".into())
            .spawn(move || {
                let opened = open_stream(
                    preferred.as_deref(),
                    period_ms,
                    recording_dir.is_some(),
                    producer,
                    Arc::clone(&running),
                    dropped,
                    dropped_pcm,
                )
                .and_then(|opened| match recording_dir {
                    Some(dir) => {
                        *recorder.lock() = Some(SegmentRecorder::create(dir, opened.sample_rate)?);
                        Ok(opened)
                    }
                    None => Ok(opened),
                });
                let OpenedStream {
                    stream,
                    name,
                    mut pcm,
                    ..
                } = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let _ = open_tx.send(Ok(name));

                let mut scratch = vec![0.0f32; 4_096];
                while running.load(Ordering::Relaxed) && !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(OWNER_POLL);
                    if let Some(pcm) = pcm.as_mut() {
                        drain_pcm(&recorder, pcm, &mut scratch);
                    }
                }
                // Stream drops here, releasing the device on its creation thread.
                drop(stream);
                debug!("microphone stream released");

                if let Some(pcm) = pcm.as_mut() {
                    drain_pcm(&recorder, pcm, &mut scratch);
                }
                if let Some(mut finished) = recorder.lock().take() {
                    if let Err(e) = finished.finish() {
                        warn!(error = %e, "last recording segment not finalized");
                    }
                }
            })
            .map_err(DriftError::Io)?;

        match open_rx.recv() {
            Ok(Ok(name)) => {
                self.device_name = Some(name);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(DriftError::SourceUnavailable(
                    "microphone thread exited before opening the device".into(),
                ))
            }
        }
    }

    fn rotate(&mut self) -> Result<Option<PathBuf>> {
        match self.recorder.lock().as_mut() {
            Some(recorder) => recorder.rotate().map(Some),
            None => Ok(None),
        }
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("microphone owner thread panicked");
            }
            info!(
                dropped = self.dropped_values(),
                dropped_pcm = self.dropped_pcm_samples(),
                "microphone stopped"
            );
        }
    }

    fn describe(&self) -> String {
        match &self.device_name {
            Some(name) => format!("microphone:{name}"),
            None => "microphone".into(),
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_pcm(recorder: &SharedRecorder, pcm: &mut MeteringConsumer, scratch: &mut [f32]) {
    if let Some(recorder) = recorder.lock().as_mut() {
        if let Err(e) = recorder.drain(pcm, scratch) {
            warn!(error = %e, "recording write failed");
        }
    }
}

struct OpenedStream {
    stream: Stream,
    name: String,
    sample_rate: u32,
    pcm: Option<MeteringConsumer>,
}

fn open_stream(
    preferred_device_name: Option<&str>,
    period_ms: u64,
    record: bool,
    producer: MeteringProducer,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    dropped_pcm: Arc<AtomicU64>,
) -> Result<OpenedStream> {
    let host = cpal::default_host();
    let mut selected_device = None;

    if let Some(preferred_name) = preferred_device_name {
        match host.input_devices() {
            Ok(mut devices) => {
                selected_device = devices.find(|device| {
                    device
                        .name()
                        .map(|name| name == preferred_name)
                        .unwrap_or(false)
                });
                if selected_device.is_none() {
                    warn!(preferred = preferred_name, "preferred input device not found, falling back");
                }
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    let device = if let Some(device) = selected_device {
        device
    } else if let Some(default) = host.default_input_device() {
        default
    } else {
        let mut devices = host
            .input_devices()
            .map_err(|e| DriftError::AudioDevice(e.to_string()))?;
        let fallback = devices.next().ok_or(DriftError::NoDefaultInputDevice)?;
        warn!("no default input device, falling back to first available input");
        fallback
    };

    let name = device.name().unwrap_or_default();
    let supported = device
        .default_input_config()
        .map_err(|e| DriftError::AudioDevice(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let config: StreamConfig = supported.config();

    info!(
        device = name.as_str(),
        sample_rate,
        channels = config.channels,
        period_ms,
        record,
        "opening metering stream"
    );

    let (pcm_tx, pcm_rx) = if record {
        let (tx, rx) = create_pcm_ring(sample_rate as usize * PCM_RING_SECONDS);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let taps = CallbackTaps {
        meter: BlockMeter::for_period(sample_rate, period_ms),
        producer,
        pcm: pcm_tx,
        running,
        dropped,
        dropped_pcm,
    };
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, taps),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, taps),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, taps),
        SampleFormat::U8 => build_stream::<u8>(&device, &config, taps),
        fmt => Err(DriftError::AudioStream(format!(
            "unsupported sample format: {fmt:?}"
        ))),
    }?;

    stream
        .play()
        .map_err(|e| DriftError::AudioStream(e.to_string()))?;

    Ok(OpenedStream {
        stream,
        name,
        sample_rate,
        pcm: pcm_rx,
    })
}

/// Everything the input callback owns.
struct CallbackTaps {
    meter: BlockMeter,
    producer: MeteringProducer,
    pcm: Option<MeteringProducer>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    dropped_pcm: Arc<AtomicU64>,
}

fn build_stream<T>(device: &cpal::Device, config: &StreamConfig, taps: CallbackTaps) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let CallbackTaps {
        mut meter,
        mut producer,
        mut pcm,
        running,
        dropped,
        dropped_pcm,
    } = taps;
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                for frame in data.chunks(channels) {
                    let mono = frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>()
                        / channels as f32;
                    if let Some(pcm) = pcm.as_mut() {
                        if pcm.try_push(mono).is_err() {
                            dropped_pcm.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if let Some(db) = meter.push(mono) {
                        if producer.try_push(db).is_err() {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            },
            |err| error!("metering stream error: {err}"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                DriftError::SourceUnavailable("input device not available".into())
            }
            other => DriftError::AudioStream(other.to_string()),
        })
}
