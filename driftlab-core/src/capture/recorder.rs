//! Rolling WAV recording of the captured audio.
//!
//! [`SegmentRecorder`] writes mono 16-bit PCM into one file per capture
//! segment (`segment-0000.wav`, `segment-0001.wav`, ...). Input is box-car
//! decimated to roughly [`RECORDING_RATE_HZ`].
//!
//! [`rotate`](SegmentRecorder::rotate) opens the next file before it
//! finalizes the current one. If the next file cannot be created the current
//! writer stays in place and keeps growing.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, warn};

use crate::buffering::{Consumer, MeteringConsumer};
use crate::error::{DriftError, Result};

pub const RECORDING_RATE_HZ: u32 = 16_000;

type SegmentWriter = WavWriter<BufWriter<File>>;

pub struct SegmentRecorder {
    dir: PathBuf,
    spec: WavSpec,
    decimation: usize,
    acc: f32,
    acc_len: usize,
    index: u32,
    current: Option<(SegmentWriter, PathBuf)>,
}

impl SegmentRecorder {
    /// Create `dir` and open the first segment. `input_rate` is the rate of
    /// the samples later handed to [`write`](Self::write).
    pub fn create(dir: impl Into<PathBuf>, input_rate: u32) -> Result<Self> {
        if input_rate == 0 {
            return Err(DriftError::InvalidConfig(
                "recording input rate must be non-zero".into(),
            ));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let decimation = (input_rate / RECORDING_RATE_HZ).max(1);
        let spec = WavSpec {
            channels: 1,
            sample_rate: input_rate / decimation,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut recorder = Self {
            dir,
            spec,
            decimation: decimation as usize,
            acc: 0.0,
            acc_len: 0,
            index: 0,
            current: None,
        };
        let first = recorder.open(0).map_err(|e| match e {
            DriftError::Rotation(msg) => DriftError::SourceUnavailable(format!("recording: {msg}")),
            other => other,
        })?;
        recorder.current = Some(first);
        info!(
            dir = %recorder.dir.display(),
            input_rate,
            sample_rate = recorder.spec.sample_rate,
            "segment recording started"
        );
        Ok(recorder)
    }

    /// Rate of the written files.
    pub fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(_, path)| path.as_path())
    }

    /// Append mono samples in [-1.0, 1.0] at the input rate.
    pub fn write(&mut self, samples: &[f32]) -> Result<()> {
        let Some((writer, _)) = self.current.as_mut() else {
            return Ok(());
        };
        for &sample in samples {
            self.acc += sample;
            self.acc_len += 1;
            if self.acc_len == self.decimation {
                writer.write_sample(to_i16(self.acc / self.decimation as f32))?;
                self.acc = 0.0;
                self.acc_len = 0;
            }
        }
        Ok(())
    }

    /// Move everything queued in `pcm` into the open segment, using
    /// `scratch` as the copy buffer. Returns the number of samples taken.
    pub fn drain(&mut self, pcm: &mut MeteringConsumer, scratch: &mut [f32]) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = pcm.pop_slice(scratch);
            if n == 0 {
                return Ok(total);
            }
            self.write(&scratch[..n])?;
            total += n;
        }
    }

    /// Close the current segment and start the next one. Returns the path
    /// of the closed file.
    pub fn rotate(&mut self) -> Result<PathBuf> {
        if self.current.is_none() {
            return Err(DriftError::Rotation("recorder already finished".into()));
        }
        let next = self.open(self.index + 1)?;
        self.index += 1;
        let Some((writer, closed)) = self.current.replace(next) else {
            return Err(DriftError::Rotation("recorder already finished".into()));
        };
        if let Err(e) = writer.finalize() {
            warn!(path = %closed.display(), error = %e, "segment header not finalized");
        }
        Ok(closed)
    }

    /// Finalize the open segment. Later writes are ignored.
    pub fn finish(&mut self) -> Result<Option<PathBuf>> {
        let Some((writer, path)) = self.current.take() else {
            return Ok(None);
        };
        writer.finalize()?;
        info!(path = %path.display(), segments = self.index + 1, "segment recording finished");
        Ok(Some(path))
    }

    fn open(&self, index: u32) -> Result<(SegmentWriter, PathBuf)> {
        let path = self.dir.join(format!("segment-{index:04}.wav"));
        let writer = WavWriter::create(&path, self.spec)
            .map_err(|e| DriftError::Rotation(format!("{}: {e}", path.display())))?;
        Ok((writer, path))
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}
