//! Block of mono PCM samples reduced to one metering value.

/// Floor reported for digital silence, matching platform metering APIs.
pub const METERING_FLOOR_DB: f32 = -160.0;

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct PcmBlock {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 44100, 48000).
    pub sample_rate: u32,
}

impl PcmBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this block in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Level of the block in dBFS, floored at [`METERING_FLOOR_DB`].
    pub fn dbfs(&self) -> f32 {
        dbfs_from_rms(self.rms())
    }
}

/// Streaming counterpart of [`PcmBlock::dbfs`] for audio callbacks: folds
/// samples in one at a time and yields a dBFS value per complete block.
/// Never allocates after construction.
#[derive(Debug, Clone)]
pub struct BlockMeter {
    block_len: usize,
    sum_sq: f64,
    count: usize,
}

impl BlockMeter {
    pub fn new(block_len: usize) -> Self {
        Self {
            block_len: block_len.max(1),
            sum_sq: 0.0,
            count: 0,
        }
    }

    /// Frames per metering value for `sample_rate` and a period in ms.
    pub fn for_period(sample_rate: u32, period_ms: u64) -> Self {
        Self::new((sample_rate as u64 * period_ms / 1000) as usize)
    }

    pub fn push(&mut self, sample: f32) -> Option<f32> {
        self.sum_sq += (sample as f64) * (sample as f64);
        self.count += 1;
        if self.count < self.block_len {
            return None;
        }
        let rms = (self.sum_sq / self.count as f64).sqrt() as f32;
        self.sum_sq = 0.0;
        self.count = 0;
        Some(dbfs_from_rms(rms))
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

pub fn dbfs_from_rms(rms: f32) -> f32 {
    if rms <= 0.0 {
        return METERING_FLOOR_DB;
    }
    (20.0 * rms.log10()).max(METERING_FLOOR_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_square_wave_is_zero_dbfs() {
        let samples: Vec<f32> = (0..480).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let block = PcmBlock::new(samples, 4800);
        assert!((block.dbfs() - 0.0).abs() < 1e-4);
        assert!((block.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn silence_hits_the_floor() {
        let block = PcmBlock::new(vec![0.0; 160], 1600);
        assert_eq!(block.dbfs(), METERING_FLOOR_DB);
        assert_eq!(PcmBlock::new(vec![], 1600).dbfs(), METERING_FLOOR_DB);
    }

    #[test]
    fn half_amplitude_is_about_minus_six_db() {
        let block = PcmBlock::new(vec![0.5; 100], 1000);
        assert!((block.dbfs() + 6.0206).abs() < 1e-3);
    }

    #[test]
    fn block_meter_matches_whole_block_level() {
        let mut meter = BlockMeter::for_period(1_000, 100);
        let outputs: Vec<f32> = (0..250).filter_map(|_| meter.push(0.5)).collect();
        assert_eq!(outputs.len(), 2);
        for db in outputs {
            assert!((db + 6.0206).abs() < 1e-3);
        }
    }
}
