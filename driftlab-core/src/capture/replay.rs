//! Replay metering source.
//!
//! Drives a session from recorded data instead of a live microphone:
//! - an in-memory vector of metering values,
//! - a text file with one dB value per line (`#` comments and blank lines
//!   skipped),
//! - a WAV file, reduced to one dBFS value per sample period.
//!
//! Values are pushed from a dedicated thread. Without pacing the thread
//! pushes as fast as the pipeline drains; with pacing it sleeps one sample
//! period between values so the session runs in wall-clock time.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::MeteringSource;
use crate::{
    buffering::{chunk::PcmBlock, MeteringProducer, Producer},
    error::{DriftError, Result},
};

/// Back-off while the ring is full.
const FULL_RING_BACKOFF: Duration = Duration::from_millis(1);

/// Observer for a replay running on its own thread.
#[derive(Debug, Clone, Default)]
pub struct ReplayHandle {
    finished: Arc<AtomicBool>,
    pushed: Arc<AtomicU64>,
}

impl ReplayHandle {
    /// True once every value has been pushed (or the replay was cut short).
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

pub struct ReplaySource {
    label: String,
    values: Option<Vec<f32>>,
    pace: Option<Duration>,
    handle: ReplayHandle,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn from_values(values: Vec<f32>) -> Self {
        Self::labelled(format!("memory[{}]", values.len()), values)
    }

    /// One metering value per line.
    pub fn from_text_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let values = parse_metering_text(&text)?;
        Ok(Self::labelled(format!("text:{}", path.display()), values))
    }

    /// One dBFS value per `sample_period` of audio.
    pub fn from_wav_file(path: impl AsRef<Path>, sample_period: Duration) -> Result<Self> {
        let path = path.as_ref();
        let (mono, sample_rate) = read_wav_mono_f32(path)?;
        let values = metering_from_pcm(&mono, sample_rate, sample_period)?;
        info!(
            path = %path.display(),
            sample_rate,
            values = values.len(),
            "loaded WAV replay"
        );
        Ok(Self::labelled(format!("wav:{}", path.display()), values))
    }

    fn labelled(label: String, values: Vec<f32>) -> Self {
        Self {
            label,
            values: Some(values),
            pace: None,
            handle: ReplayHandle::default(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Sleep `period` between pushed values.
    pub fn paced(mut self, period: Duration) -> Self {
        self.pace = Some(period);
        self
    }

    pub fn handle(&self) -> ReplayHandle {
        self.handle.clone()
    }
}

impl MeteringSource for ReplaySource {
    fn start(&mut self, mut producer: MeteringProducer, running: Arc<AtomicBool>) -> Result<()> {
        let values = self
            .values
            .take()
            .ok_or_else(|| DriftError::Replay("replay source already started".into()))?;
        let pace = self.pace;
        let handle = self.handle.clone();
        let stop_flag = Arc::clone(&self.stop_flag);

        info!(source = %self.label, values = values.len(), paced = pace.is_some(), "replay started");

        let worker = std::thread::Builder::new()
            .name("driftlab-replay".into())
            .spawn(move || {
                let live = || running.load(Ordering::Relaxed) && !stop_flag.load(Ordering::Relaxed);
                'values: for value in values {
                    while producer.try_push(value).is_err() {
                        if !live() {
                            break 'values;
                        }
                        std::thread::sleep(FULL_RING_BACKOFF);
                    }
                    handle.pushed.fetch_add(1, Ordering::Relaxed);
                    if !live() {
                        break;
                    }
                    if let Some(period) = pace {
                        std::thread::sleep(period);
                    }
                }
                handle.finished.store(true, Ordering::Release);
                debug!(pushed = handle.pushed(), "replay thread finished");
            })
            .map_err(DriftError::Io)?;

        self.worker = Some(worker);
        Ok(())
    }

    fn rotate(&mut self) -> Result<Option<PathBuf>> {
        // Replays re-read an existing artifact and record nothing.
        Ok(None)
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(source = %self.label, "replay thread panicked");
            }
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn parse_metering_text(text: &str) -> Result<Vec<f32>> {
    let mut values = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let value = line.parse::<f32>().map_err(|_| {
            DriftError::Replay(format!("line {}: '{line}' is not a number", idx + 1))
        })?;
        values.push(value);
    }
    Ok(values)
}

fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            if spec.bits_per_sample <= 16 {
                reader
                    .samples::<i16>()
                    .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Reduce PCM to one dBFS value per complete `sample_period` block. A
/// trailing partial block is dropped.
fn metering_from_pcm(mono: &[f32], sample_rate: u32, sample_period: Duration) -> Result<Vec<f32>> {
    let block_len = (sample_rate as u128 * sample_period.as_millis() / 1000) as usize;
    if block_len == 0 {
        return Err(DriftError::Replay(format!(
            "sample period {sample_period:?} is shorter than one frame at {sample_rate} Hz"
        )));
    }
    Ok(mono
        .chunks_exact(block_len)
        .map(|block| PcmBlock::new(block.to_vec(), sample_rate).dbfs())
        .collect())
}
